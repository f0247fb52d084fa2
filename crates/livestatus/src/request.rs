use crate::{Comparison, Filter, Op, ParseError, StatsOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Csv,
    Json,
    WrappedJson,
    Python,
    Python3,
}

impl OutputFormat {
    fn parse(line: usize, s: &str) -> Result<Self, ParseError> {
        Ok(match s {
            "csv" => OutputFormat::Csv,
            "json" => OutputFormat::Json,
            "wrapped_json" => OutputFormat::WrappedJson,
            "python" => OutputFormat::Python,
            "python3" => OutputFormat::Python3,
            other => {
                return Err(ParseError::new(
                    line,
                    format!("unknown output format: {other}"),
                ))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseHeader {
    #[default]
    Off,
    Fixed16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTrigger {
    Check,
    State,
    Command,
    Program,
    Log,
    Downtime,
    Comment,
    All,
}

impl WaitTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitTrigger::Check => "check",
            WaitTrigger::State => "state",
            WaitTrigger::Command => "command",
            WaitTrigger::Program => "program",
            WaitTrigger::Log => "log",
            WaitTrigger::Downtime => "downtime",
            WaitTrigger::Comment => "comment",
            WaitTrigger::All => "all",
        }
    }

    fn parse(line: usize, s: &str) -> Result<Self, ParseError> {
        Ok(match s {
            "check" => WaitTrigger::Check,
            "state" => WaitTrigger::State,
            "command" => WaitTrigger::Command,
            "program" => WaitTrigger::Program,
            "log" => WaitTrigger::Log,
            "downtime" => WaitTrigger::Downtime,
            "comment" => WaitTrigger::Comment,
            "all" => WaitTrigger::All,
            other => {
                return Err(ParseError::new(
                    line,
                    format!("unknown wait trigger: {other}"),
                ))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub column: String,
    pub desc: bool,
}

/// csv separator codes, in header order: dataset, column, list, host-service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Separators {
    pub dataset: u8,
    pub field: u8,
    pub list: u8,
    pub host_service: u8,
}

impl Default for Separators {
    fn default() -> Self {
        Self {
            dataset: b'\n',
            field: b';',
            list: b',',
            host_service: b'|',
        }
    }
}

/// A parsed frontend request. Either a `GET <table>` query or a
/// `COMMAND [...]` line (in which case `command` is set and the query
/// fields are unused except for `backends` routing).
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub table: String,
    pub command: Option<String>,
    pub columns: Vec<String>,
    pub filter: Option<Filter>,
    pub stats: Vec<StatsOp>,
    pub sort: Vec<SortSpec>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub output_format: OutputFormat,
    pub response_header: ResponseHeader,
    /// None means protocol default: headers on only when no Columns given.
    pub column_headers: Option<bool>,
    pub keepalive: bool,
    pub backends: Vec<String>,
    pub auth_user: Option<String>,
    pub wait_condition: Option<Filter>,
    pub wait_trigger: Option<WaitTrigger>,
    pub wait_timeout_ms: Option<u64>,
    pub wait_object: Option<String>,
    pub localtime: Option<i64>,
    pub separators: Separators,
}

impl Request {
    pub fn is_command(&self) -> bool {
        self.command.is_some()
    }

    /// Protocol default: a header row only when the client named no
    /// columns, and never for stats results.
    pub fn send_column_headers(&self) -> bool {
        self.column_headers
            .unwrap_or(self.columns.is_empty() && self.stats.is_empty())
    }

    /// Parse a complete request. `text` is everything up to (not including)
    /// the terminating blank line.
    pub fn parse(text: &str) -> Result<Request, ParseError> {
        let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l.trim_end()));
        let (_, first) = lines
            .next()
            .ok_or_else(|| ParseError::new(1, "empty request"))?;

        let mut req = Request::default();
        if let Some(rest) = first.strip_prefix("COMMAND ") {
            if rest.is_empty() {
                return Err(ParseError::new(1, "missing command"));
            }
            req.command = Some(rest.to_string());
        } else if let Some(rest) = first.strip_prefix("GET ") {
            let table = rest.trim();
            if table.is_empty() || !table.bytes().all(|b| b.is_ascii_lowercase() || b == b'_') {
                return Err(ParseError::new(1, format!("invalid table name: {table}")));
            }
            req.table = table.to_string();
        } else {
            return Err(ParseError::new(
                1,
                format!("expected GET or COMMAND, got: {first}"),
            ));
        }

        let mut filter_stack: Vec<Filter> = Vec::new();
        let mut wait_stack: Vec<Filter> = Vec::new();

        for (no, line) in lines {
            if line.is_empty() {
                break;
            }
            let (key, args) = match line.split_once(':') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => return Err(ParseError::new(no, format!("malformed header: {line}"))),
            };
            match key {
                "Columns" => {
                    req.columns = args.split_ascii_whitespace().map(String::from).collect()
                }
                "Filter" => filter_stack.push(parse_comparison(no, args)?),
                "And" => combine(no, &mut filter_stack, args, Combine::And)?,
                "Or" => combine(no, &mut filter_stack, args, Combine::Or)?,
                "Negate" => combine(no, &mut filter_stack, args, Combine::Negate)?,
                "Stats" => req.stats.push(parse_stats(no, args)?),
                "StatsAnd" => combine_stats(no, &mut req.stats, args, Combine::And)?,
                "StatsOr" => combine_stats(no, &mut req.stats, args, Combine::Or)?,
                "StatsNegate" => combine_stats(no, &mut req.stats, args, Combine::Negate)?,
                "Sort" => req.sort.push(parse_sort(no, args)?),
                "Limit" => {
                    req.limit = Some(
                        args.parse()
                            .map_err(|_| ParseError::new(no, format!("invalid limit: {args}")))?,
                    )
                }
                "Offset" => {
                    req.offset = args
                        .parse()
                        .map_err(|_| ParseError::new(no, format!("invalid offset: {args}")))?
                }
                "OutputFormat" => req.output_format = OutputFormat::parse(no, args)?,
                "ResponseHeader" => {
                    req.response_header = match args {
                        "off" | "" => ResponseHeader::Off,
                        "fixed16" => ResponseHeader::Fixed16,
                        other => {
                            return Err(ParseError::new(
                                no,
                                format!("unknown response header: {other}"),
                            ))
                        }
                    }
                }
                "ColumnHeaders" => req.column_headers = Some(parse_on_off(no, args)?),
                "KeepAlive" => req.keepalive = parse_on_off(no, args)?,
                "Backends" => {
                    req.backends = args.split_ascii_whitespace().map(String::from).collect()
                }
                "AuthUser" => req.auth_user = Some(args.to_string()),
                "WaitCondition" => wait_stack.push(parse_comparison(no, args)?),
                "WaitConditionAnd" => combine(no, &mut wait_stack, args, Combine::And)?,
                "WaitConditionOr" => combine(no, &mut wait_stack, args, Combine::Or)?,
                "WaitConditionNegate" => combine(no, &mut wait_stack, args, Combine::Negate)?,
                "WaitTrigger" => req.wait_trigger = Some(WaitTrigger::parse(no, args)?),
                "WaitObject" => req.wait_object = Some(args.to_string()),
                "WaitTimeout" => {
                    req.wait_timeout_ms = Some(
                        args.parse()
                            .map_err(|_| ParseError::new(no, format!("invalid timeout: {args}")))?,
                    )
                }
                "Localtime" => {
                    req.localtime = Some(
                        args.parse()
                            .map_err(|_| ParseError::new(no, format!("invalid localtime: {args}")))?,
                    )
                }
                "Separators" => req.separators = parse_separators(no, args)?,
                other => {
                    return Err(ParseError::new(no, format!("unknown request header: {other}")))
                }
            }
        }

        req.filter = fold_stack(filter_stack);
        req.wait_condition = fold_stack(wait_stack);
        Ok(req)
    }

    /// Render back into wire form. Used for passthrough tables and for the
    /// requests built for sub-peers, so it deliberately omits the
    /// lsmux-only headers (Backends, KeepAlive, ResponseHeader).
    pub fn render_for_backend(&self) -> String {
        let mut out = String::new();
        if let Some(cmd) = &self.command {
            out.push_str("COMMAND ");
            out.push_str(cmd);
            out.push('\n');
            return out;
        }
        out.push_str("GET ");
        out.push_str(&self.table);
        out.push('\n');
        if !self.columns.is_empty() {
            out.push_str("Columns: ");
            out.push_str(&self.columns.join(" "));
            out.push('\n');
        }
        if let Some(f) = &self.filter {
            render_root(f, "Filter", &mut out);
        }
        for s in &self.stats {
            match s {
                // Unlike Filter lines, every Stats line is its own counter,
                // so composite counters keep their StatsAnd/StatsOr tail.
                StatsOp::Count(f) => f.render("Stats", &mut out),
                StatsOp::Sum(c) => out.push_str(&format!("Stats: sum {c}\n")),
                StatsOp::Avg(c) => out.push_str(&format!("Stats: avg {c}\n")),
                StatsOp::Min(c) => out.push_str(&format!("Stats: min {c}\n")),
                StatsOp::Max(c) => out.push_str(&format!("Stats: max {c}\n")),
                StatsOp::Std(c) => out.push_str(&format!("Stats: std {c}\n")),
            }
        }
        for s in &self.sort {
            out.push_str(&format!(
                "Sort: {} {}\n",
                s.column,
                if s.desc { "desc" } else { "asc" }
            ));
        }
        // Passthrough tables have no local snapshot to wait on, so the
        // wait headers travel to the peer instead.
        if let Some(w) = &self.wait_condition {
            render_root(w, "WaitCondition", &mut out);
        }
        if let Some(t) = self.wait_trigger {
            out.push_str(&format!("WaitTrigger: {}\n", t.as_str()));
        }
        if let Some(o) = &self.wait_object {
            out.push_str(&format!("WaitObject: {o}\n"));
        }
        if let Some(ms) = self.wait_timeout_ms {
            out.push_str(&format!("WaitTimeout: {ms}\n"));
        }
        if let Some(l) = self.limit {
            // Offset is applied after the merge, so backends must return
            // enough rows to cover it.
            out.push_str(&format!("Limit: {}\n", l + self.offset));
        }
        out.push_str("OutputFormat: json\nResponseHeader: fixed16\n\n");
        out
    }
}

// A root And of filter lines is the implicit protocol conjunction, not a
// user-built group, so it renders without a trailing "And:" line.
fn render_root(f: &Filter, header: &str, out: &mut String) {
    match f {
        Filter::And(kids) => {
            for k in kids {
                k.render(header, out);
            }
        }
        other => other.render(header, out),
    }
}

enum Combine {
    And,
    Or,
    Negate,
}

fn parse_count(no: usize, args: &str) -> Result<usize, ParseError> {
    args.trim()
        .parse()
        .map_err(|_| ParseError::new(no, format!("invalid count: {args}")))
}

fn combine(
    no: usize,
    stack: &mut Vec<Filter>,
    args: &str,
    kind: Combine,
) -> Result<(), ParseError> {
    match kind {
        Combine::Negate => {
            let kid = stack
                .pop()
                .ok_or_else(|| ParseError::new(no, "Negate without filter"))?;
            stack.push(Filter::Negate(Box::new(kid)));
        }
        Combine::And | Combine::Or => {
            let n = parse_count(no, args)?;
            if n > stack.len() {
                return Err(ParseError::new(
                    no,
                    format!("group of {n} exceeds {} filters on stack", stack.len()),
                ));
            }
            let kids = stack.split_off(stack.len() - n);
            // And 1 / Or 1 are no-ops.
            let node = if kids.len() == 1 {
                kids.into_iter().next().unwrap()
            } else if matches!(kind, Combine::And) {
                Filter::And(kids)
            } else {
                Filter::Or(kids)
            };
            stack.push(node);
        }
    }
    Ok(())
}

fn combine_stats(
    no: usize,
    stats: &mut Vec<StatsOp>,
    args: &str,
    kind: Combine,
) -> Result<(), ParseError> {
    let n = match kind {
        Combine::Negate => 1,
        _ => parse_count(no, args)?,
    };
    if n > stats.len() {
        return Err(ParseError::new(
            no,
            format!("group of {n} exceeds {} stats on stack", stats.len()),
        ));
    }
    let tail = stats.split_off(stats.len() - n);
    let mut filters = Vec::with_capacity(tail.len());
    for op in tail {
        match op {
            StatsOp::Count(f) => filters.push(f),
            other => {
                return Err(ParseError::new(
                    no,
                    format!("cannot combine aggregation stats: {other:?}"),
                ))
            }
        }
    }
    let combined = match kind {
        Combine::Negate => Filter::Negate(Box::new(filters.into_iter().next().unwrap())),
        _ if filters.len() == 1 => filters.into_iter().next().unwrap(),
        Combine::And => Filter::And(filters),
        Combine::Or => Filter::Or(filters),
    };
    stats.push(StatsOp::Count(combined));
    Ok(())
}

fn fold_stack(mut stack: Vec<Filter>) -> Option<Filter> {
    match stack.len() {
        0 => None,
        1 => stack.pop(),
        // Multiple toplevel Filter lines are an implicit conjunction.
        _ => Some(Filter::And(stack)),
    }
}

fn parse_comparison(no: usize, args: &str) -> Result<Filter, ParseError> {
    let mut parts = args.splitn(3, char::is_whitespace);
    let column = parts
        .next()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ParseError::new(no, "missing column in filter"))?;
    let op_token = parts
        .next()
        .ok_or_else(|| ParseError::new(no, "missing operator in filter"))?;
    let op = Op::parse(op_token)
        .ok_or_else(|| ParseError::new(no, format!("unknown operator: {op_token}")))?;
    let value = parts.next().unwrap_or("");
    Ok(Filter::Compare(Comparison::new(no, column, op, value)?))
}

fn parse_stats(no: usize, args: &str) -> Result<StatsOp, ParseError> {
    let mut parts = args.split_ascii_whitespace();
    let first = parts
        .next()
        .ok_or_else(|| ParseError::new(no, "empty stats expression"))?;
    let make = |col: Option<&str>, f: fn(String) -> StatsOp| {
        col.map(|c| f(c.to_string()))
            .ok_or_else(|| ParseError::new(no, "missing stats column"))
    };
    match first {
        "sum" => make(parts.next(), StatsOp::Sum),
        "avg" => make(parts.next(), StatsOp::Avg),
        "min" => make(parts.next(), StatsOp::Min),
        "max" => make(parts.next(), StatsOp::Max),
        "std" => make(parts.next(), StatsOp::Std),
        _ => Ok(StatsOp::Count(parse_comparison(no, args)?)),
    }
}

fn parse_sort(no: usize, args: &str) -> Result<SortSpec, ParseError> {
    let mut parts = args.split_ascii_whitespace();
    let column = parts
        .next()
        .ok_or_else(|| ParseError::new(no, "missing sort column"))?
        .to_string();
    let desc = match parts.next() {
        None | Some("asc") => false,
        Some("desc") => true,
        Some(other) => {
            return Err(ParseError::new(no, format!("invalid sort order: {other}")))
        }
    };
    Ok(SortSpec { column, desc })
}

fn parse_on_off(no: usize, args: &str) -> Result<bool, ParseError> {
    match args {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(ParseError::new(no, format!("expected on/off, got: {other}"))),
    }
}

fn parse_separators(no: usize, args: &str) -> Result<Separators, ParseError> {
    let codes: Vec<u8> = args
        .split_ascii_whitespace()
        .map(|s| s.parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| ParseError::new(no, format!("invalid separators: {args}")))?;
    if codes.len() != 4 {
        return Err(ParseError::new(no, "expected 4 separator codes"));
    }
    Ok(Separators {
        dataset: codes[0],
        field: codes[1],
        list: codes[2],
        host_service: codes[3],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn minimal_get() {
        let req = Request::parse("GET hosts").unwrap();
        assert_eq!(req.table, "hosts");
        assert!(req.columns.is_empty());
        assert!(req.send_column_headers());
        assert_eq!(req.output_format, OutputFormat::Csv);
    }

    #[test]
    fn full_header_set() {
        let req = Request::parse(
            "GET services\n\
             Columns: host_name description state\n\
             Filter: state = 2\n\
             Filter: has_been_checked = 1\n\
             And: 2\n\
             Sort: host_name asc\n\
             Sort: state desc\n\
             Limit: 10\n\
             Offset: 5\n\
             OutputFormat: wrapped_json\n\
             ResponseHeader: fixed16\n\
             ColumnHeaders: on\n\
             KeepAlive: on\n\
             Backends: p1 p2\n\
             AuthUser: bob",
        )
        .unwrap();
        assert_eq!(req.columns.len(), 3);
        assert!(matches!(req.filter, Some(Filter::And(_))));
        assert_eq!(req.sort.len(), 2);
        assert!(req.sort[1].desc);
        assert_eq!(req.limit, Some(10));
        assert_eq!(req.offset, 5);
        assert_eq!(req.output_format, OutputFormat::WrappedJson);
        assert_eq!(req.response_header, ResponseHeader::Fixed16);
        assert!(req.keepalive);
        assert_eq!(req.backends, vec!["p1", "p2"]);
        assert_eq!(req.auth_user.as_deref(), Some("bob"));
    }

    #[test]
    fn and_or_identities() {
        // And 1 / Or 1 are no-ops.
        let single = Request::parse("GET hosts\nFilter: state = 0\nAnd: 1").unwrap();
        assert!(matches!(single.filter, Some(Filter::Compare(_))));
        let single = Request::parse("GET hosts\nFilter: state = 0\nOr: 1").unwrap();
        assert!(matches!(single.filter, Some(Filter::Compare(_))));
    }

    #[test]
    fn multiple_filters_combine_as_and() {
        let req =
            Request::parse("GET hosts\nFilter: state = 0\nFilter: name ~ ^web").unwrap();
        let f = req.filter.unwrap();
        let get = |col: &str| -> Value {
            match col {
                "state" => Value::Int(0),
                "name" => Value::Str("web01".into()),
                _ => Value::Nil,
            }
        };
        assert!(f.matches(&get));
        match f {
            Filter::And(kids) => assert_eq!(kids.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn unbalanced_group_is_an_error() {
        let err = Request::parse("GET hosts\nFilter: state = 0\nAnd: 2").unwrap_err();
        assert_eq!(err.line, 3);
        let err = Request::parse("GET hosts\nNegate:").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn stats_forms() {
        let req = Request::parse(
            "GET services\n\
             Stats: state = 0\n\
             Stats: state = 1\n\
             StatsOr: 2\n\
             Stats: sum execution_time\n\
             Stats: avg latency",
        )
        .unwrap();
        assert_eq!(req.stats.len(), 3);
        assert!(matches!(req.stats[0], StatsOp::Count(Filter::Or(_))));
        assert!(matches!(req.stats[1], StatsOp::Sum(_)));
        assert!(matches!(req.stats[2], StatsOp::Avg(_)));
    }

    #[test]
    fn stats_and_rejects_aggregations() {
        let err = Request::parse(
            "GET services\nStats: sum latency\nStats: state = 0\nStatsAnd: 2",
        )
        .unwrap_err();
        assert_eq!(err.line, 4);
    }

    #[test]
    fn commands_carry_their_line() {
        let req = Request::parse("COMMAND [123] SCHEDULE_HOST_CHECK;web01;456").unwrap();
        assert_eq!(
            req.command.as_deref(),
            Some("[123] SCHEDULE_HOST_CHECK;web01;456")
        );
        assert!(req.is_command());
    }

    #[test]
    fn unknown_header_is_an_error() {
        let err = Request::parse("GET hosts\nBogus: 1").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("Bogus"));
    }

    #[test]
    fn wait_headers() {
        let req = Request::parse(
            "GET hosts\n\
             WaitCondition: name = newhost\n\
             WaitTrigger: check\n\
             WaitTimeout: 500\n\
             WaitObject: newhost",
        )
        .unwrap();
        assert!(req.wait_condition.is_some());
        assert_eq!(req.wait_trigger, Some(WaitTrigger::Check));
        assert_eq!(req.wait_timeout_ms, Some(500));
        assert_eq!(req.wait_object.as_deref(), Some("newhost"));
    }

    #[test]
    fn separators_header() {
        let req = Request::parse("GET hosts\nSeparators: 10 59 44 124").unwrap();
        assert_eq!(req.separators, Separators::default());
        let err = Request::parse("GET hosts\nSeparators: 10 59").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn render_for_backend_forwards_wait_headers() {
        let req = Request::parse(
            "GET log\n\
             Columns: time message\n\
             WaitCondition: class = 2\n\
             WaitCondition: type = SERVICE ALERT\n\
             WaitConditionOr: 2\n\
             WaitTrigger: log\n\
             WaitObject: web01\n\
             WaitTimeout: 2000",
        )
        .unwrap();
        let rendered = req.render_for_backend();
        assert!(rendered.contains("WaitCondition: class = 2\n"));
        assert!(rendered.contains("WaitCondition: type = SERVICE ALERT\n"));
        assert!(rendered.contains("WaitConditionOr: 2\n"));
        assert!(rendered.contains("WaitTrigger: log\n"));
        assert!(rendered.contains("WaitObject: web01\n"));
        assert!(rendered.contains("WaitTimeout: 2000\n"));
    }

    #[test]
    fn render_for_backend_round_trips() {
        let req = Request::parse(
            "GET services\nColumns: host_name state\nFilter: state = 2\nLimit: 5\nOffset: 2",
        )
        .unwrap();
        let rendered = req.render_for_backend();
        assert!(rendered.starts_with("GET services\n"));
        assert!(rendered.contains("Columns: host_name state\n"));
        assert!(rendered.contains("Filter: state = 2\n"));
        assert!(rendered.contains("Limit: 7\n"));
        assert!(rendered.ends_with("\n\n"));
    }
}
