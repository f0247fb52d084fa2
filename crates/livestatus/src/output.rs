use std::collections::BTreeMap;

use crate::{OutputFormat, Request, ResponseHeader, Separators, Value};

/// The merged, sorted, paginated result of one query, ready for encoding.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Row count before Limit/Offset were applied.
    pub total_count: usize,
    /// Peer id -> error message for peers that could not serve the query.
    pub failed: BTreeMap<String, String>,
}

impl ResultSet {
    pub fn render(&self, req: &Request) -> Vec<u8> {
        match req.output_format {
            OutputFormat::Csv => self.render_csv(req),
            // python output is JSON-shaped for every type we emit.
            OutputFormat::Json | OutputFormat::Python | OutputFormat::Python3 => {
                self.render_json(req)
            }
            OutputFormat::WrappedJson => self.render_wrapped_json(req),
        }
    }

    fn render_csv(&self, req: &Request) -> Vec<u8> {
        let sep = &req.separators;
        let mut out = Vec::new();
        if req.send_column_headers() && !self.columns.is_empty() {
            push_csv_row(
                &mut out,
                self.columns.iter().map(|c| c.clone().into_bytes()),
                sep,
            );
        }
        for row in &self.rows {
            push_csv_row(
                &mut out,
                row.iter().map(|v| csv_cell(v, sep).into_bytes()),
                sep,
            );
        }
        out
    }

    fn render_json(&self, req: &Request) -> Vec<u8> {
        let mut rows = Vec::with_capacity(self.rows.len() + 1);
        if req.send_column_headers() && !self.columns.is_empty() {
            rows.push(serde_json::Value::Array(
                self.columns
                    .iter()
                    .map(|c| serde_json::Value::String(c.clone()))
                    .collect(),
            ));
        }
        for row in &self.rows {
            rows.push(serde_json::Value::Array(
                row.iter().map(|v| v.to_json()).collect(),
            ));
        }
        let mut out = serde_json::to_vec(&serde_json::Value::Array(rows)).unwrap_or_default();
        out.push(b'\n');
        out
    }

    fn render_wrapped_json(&self, _req: &Request) -> Vec<u8> {
        let data: Vec<serde_json::Value> = self
            .rows
            .iter()
            .map(|row| serde_json::Value::Array(row.iter().map(|v| v.to_json()).collect()))
            .collect();
        let wrapped = serde_json::json!({
            "data": data,
            "columns": self.columns,
            "total_count": self.total_count,
            "failed": self.failed,
        });
        let mut out = serde_json::to_vec(&wrapped).unwrap_or_default();
        out.push(b'\n');
        out
    }
}

fn push_csv_row(out: &mut Vec<u8>, cells: impl Iterator<Item = Vec<u8>>, sep: &Separators) {
    for (i, cell) in cells.enumerate() {
        if i > 0 {
            out.push(sep.field);
        }
        out.extend_from_slice(&cell);
    }
    out.push(sep.dataset);
}

fn csv_cell(v: &Value, sep: &Separators) -> String {
    let list = sep.list as char;
    let hs = sep.host_service as char;
    match v {
        Value::Nil => String::new(),
        Value::StrList(l) => l.join(&list.to_string()),
        Value::IntList(l) => l
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(&list.to_string()),
        Value::Hash(m) => m
            .iter()
            .map(|(k, val)| format!("{k}{hs}{val}"))
            .collect::<Vec<_>>()
            .join(&list.to_string()),
        Value::ServiceList(l) => l
            .iter()
            .map(|s| format!("{}{hs}{}{hs}{}", s.description, s.state, s.has_been_checked))
            .collect::<Vec<_>>()
            .join(&list.to_string()),
        scalar => scalar.to_wire_string(),
    }
}

/// The 16-byte `"%3d %11d\n"` response prefix.
pub fn fixed16(code: u16, body_len: usize) -> String {
    format!("{code:>3} {body_len:>11}\n")
}

/// Assemble the bytes written back to the client for one request.
pub fn frame_response(header: ResponseHeader, code: u16, body: &[u8]) -> Vec<u8> {
    match header {
        ResponseHeader::Off => body.to_vec(),
        ResponseHeader::Fixed16 => {
            let mut out = fixed16(code, body.len()).into_bytes();
            out.extend_from_slice(body);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;

    fn result_3_hosts() -> ResultSet {
        ResultSet {
            columns: vec!["name".into(), "state".into()],
            rows: vec![
                vec![Value::Str("a".into()), Value::Int(0)],
                vec![Value::Str("b".into()), Value::Int(0)],
                vec![Value::Str("c".into()), Value::Int(0)],
            ],
            total_count: 3,
            failed: BTreeMap::new(),
        }
    }

    #[test]
    fn csv_with_explicit_columns_has_no_header_row() {
        let req = Request::parse("GET hosts\nColumns: name state").unwrap();
        let body = result_3_hosts().render(&req);
        assert_eq!(body, b"a;0\nb;0\nc;0\n");
    }

    #[test]
    fn csv_header_row_on_request() {
        let req = Request::parse("GET hosts\nColumns: name state\nColumnHeaders: on").unwrap();
        let body = result_3_hosts().render(&req);
        assert_eq!(body, b"name;state\na;0\nb;0\nc;0\n");
    }

    #[test]
    fn json_body() {
        let req = Request::parse("GET hosts\nColumns: name state\nOutputFormat: json").unwrap();
        let body = result_3_hosts().render(&req);
        assert_eq!(body, b"[[\"a\",0],[\"b\",0],[\"c\",0]]\n");
    }

    #[test]
    fn wrapped_json_carries_meta() {
        let req =
            Request::parse("GET hosts\nColumns: name state\nOutputFormat: wrapped_json").unwrap();
        let mut rs = result_3_hosts();
        rs.failed.insert("p2".into(), "connection refused".into());
        let body = rs.render(&req);
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["total_count"], 3);
        assert_eq!(parsed["data"].as_array().unwrap().len(), 3);
        assert_eq!(parsed["failed"]["p2"], "connection refused");
        assert_eq!(parsed["columns"][0], "name");
    }

    #[test]
    fn fixed16_is_sixteen_bytes_and_exact() {
        let req = Request::parse(
            "GET hosts\nColumns: name state\nResponseHeader: fixed16",
        )
        .unwrap();
        let body = result_3_hosts().render(&req);
        let framed = frame_response(req.response_header, 200, &body);
        assert_eq!(&framed[..16], format!("200 {:>11}\n", body.len()).as_bytes());
        assert_eq!(framed.len(), 16 + body.len());
        // Declared length equals the bytes after the header.
        let declared: usize = std::str::from_utf8(&framed[4..15])
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(declared, framed.len() - 16);
    }

    #[test]
    fn custom_separators() {
        let mut req = Request::parse("GET hosts\nColumns: name state").unwrap();
        req.separators = Separators {
            dataset: b'\n',
            field: b',',
            list: b';',
            host_service: b'!',
        };
        let body = result_3_hosts().render(&req);
        assert_eq!(body, b"a,0\nb,0\nc,0\n");
    }
}
