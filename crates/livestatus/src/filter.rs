use regex::{Regex, RegexBuilder};

use crate::{ParseError, Value};

/// Comparison operator, longest token first when scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equal,
    Unequal,
    Match,
    MatchNoCase,
    NoMatch,
    NoMatchNoCase,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

// Order matters: scanned front to back, so longer tokens come first.
const OP_TOKENS: &[(&str, Op)] = &[
    ("!~~", Op::NoMatchNoCase),
    (">=", Op::GreaterEqual),
    ("<=", Op::LessEqual),
    ("!=", Op::Unequal),
    ("!~", Op::NoMatch),
    ("~~", Op::MatchNoCase),
    ("~", Op::Match),
    ("=", Op::Equal),
    ("<", Op::Less),
    (">", Op::Greater),
];

impl Op {
    pub fn parse(token: &str) -> Option<Op> {
        OP_TOKENS
            .iter()
            .find(|(t, _)| *t == token)
            .map(|(_, op)| *op)
    }

    pub fn as_str(&self) -> &'static str {
        OP_TOKENS
            .iter()
            .find(|(_, op)| op == self)
            .map(|(t, _)| *t)
            .unwrap_or("=")
    }

    fn is_regex(&self) -> bool {
        matches!(
            self,
            Op::Match | Op::MatchNoCase | Op::NoMatch | Op::NoMatchNoCase
        )
    }
}

/// A single `Filter: <column> <op> <value>` line. The regex for `~`-family
/// operators is compiled when the request is parsed and dies with it.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub column: String,
    pub op: Op,
    pub value: String,
    num: Option<f64>,
    regex: Option<Regex>,
}

impl Comparison {
    pub fn new(line: usize, column: &str, op: Op, value: &str) -> Result<Self, ParseError> {
        let regex = if op.is_regex() {
            let nocase = matches!(op, Op::MatchNoCase | Op::NoMatchNoCase);
            Some(
                RegexBuilder::new(value)
                    .case_insensitive(nocase)
                    .build()
                    .map_err(|e| ParseError::new(line, format!("invalid regex: {e}")))?,
            )
        } else {
            None
        };
        Ok(Self {
            column: column.to_string(),
            op,
            value: value.to_string(),
            num: value.parse().ok(),
            regex,
        })
    }

    pub fn matches(&self, cell: &Value) -> bool {
        // Missing cells satisfy only the negated operators, never a
        // positive comparison (not even `=` against the empty value).
        if matches!(cell, Value::Nil) {
            return matches!(self.op, Op::Unequal | Op::NoMatch | Op::NoMatchNoCase);
        }
        match cell {
            Value::StrList(list) => self.matches_str_list(list),
            Value::IntList(list) => {
                let strs: Vec<String> = list.iter().map(|i| i.to_string()).collect();
                self.matches_str_list(&strs)
            }
            Value::ServiceList(list) => {
                let strs: Vec<String> = list.iter().map(|s| s.description.clone()).collect();
                self.matches_str_list(&strs)
            }
            Value::Hash(map) => match self.op {
                // Contains-key semantics for hashes.
                Op::GreaterEqual => map.contains_key(&self.value),
                Op::Less => !map.contains_key(&self.value),
                Op::Equal => self.value.is_empty() && map.is_empty(),
                Op::Unequal => !(self.value.is_empty() && map.is_empty()),
                _ => false,
            },
            Value::Int(i) if self.op.is_regex() => self.matches_int_bits(*i),
            other => self.matches_scalar(other),
        }
    }

    fn matches_scalar(&self, cell: &Value) -> bool {
        match self.op {
            Op::Match => self.regex_matches(&cell.to_wire_string()),
            Op::MatchNoCase => self.regex_matches(&cell.to_wire_string()),
            Op::NoMatch | Op::NoMatchNoCase => !self.regex_matches(&cell.to_wire_string()),
            Op::Equal | Op::Unequal | Op::Less | Op::LessEqual | Op::Greater | Op::GreaterEqual => {
                let ord = match (cell.as_float(), self.num) {
                    (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
                    _ => cell.to_wire_string().as_str().cmp(self.value.as_str()),
                };
                match self.op {
                    Op::Equal => ord.is_eq(),
                    Op::Unequal => !ord.is_eq(),
                    Op::Less => ord.is_lt(),
                    Op::LessEqual => ord.is_le(),
                    Op::Greater => ord.is_gt(),
                    Op::GreaterEqual => ord.is_ge(),
                    _ => unreachable!(),
                }
            }
        }
    }

    // List semantics: `>=` is contains, `<` is not-contains, `=` with an
    // empty value tests for the empty list, `~`-ops match any element.
    fn matches_str_list(&self, list: &[String]) -> bool {
        match self.op {
            Op::GreaterEqual => list.iter().any(|e| e == &self.value),
            Op::Less => !list.iter().any(|e| e == &self.value),
            Op::Equal => self.value.is_empty() && list.is_empty(),
            Op::Unequal => !(self.value.is_empty() && list.is_empty()),
            Op::Match | Op::MatchNoCase => list.iter().any(|e| self.regex_matches(e)),
            Op::NoMatch | Op::NoMatchNoCase => !list.iter().any(|e| self.regex_matches(e)),
            _ => false,
        }
    }

    // Bit operators on int flag columns: `~` all mask bits set,
    // `~~` any mask bit set, negations accordingly.
    fn matches_int_bits(&self, cell: i64) -> bool {
        let mask = self.num.map(|n| n as i64).unwrap_or(0);
        match self.op {
            Op::Match => cell & mask == mask,
            Op::MatchNoCase => cell & mask != 0,
            Op::NoMatch => cell & mask != mask,
            Op::NoMatchNoCase => cell & mask == 0,
            _ => unreachable!(),
        }
    }

    fn regex_matches(&self, s: &str) -> bool {
        self.regex.as_ref().map(|r| r.is_match(s)).unwrap_or(false)
    }
}

/// Filter expression tree, shared by Filter, Stats counters and
/// WaitCondition headers.
#[derive(Debug, Clone)]
pub enum Filter {
    Compare(Comparison),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Negate(Box<Filter>),
}

impl Filter {
    /// Evaluate against a row, reading cells through `get`. Unknown columns
    /// yield `Value::Nil`, which no positive comparison matches.
    pub fn matches(&self, get: &dyn Fn(&str) -> Value) -> bool {
        match self {
            Filter::Compare(c) => c.matches(&get(&c.column)),
            Filter::And(kids) => kids.iter().all(|k| k.matches(get)),
            Filter::Or(kids) => kids.iter().any(|k| k.matches(get)),
            Filter::Negate(kid) => !kid.matches(get),
        }
    }

    /// Column names referenced anywhere in the tree.
    pub fn columns(&self, out: &mut Vec<String>) {
        match self {
            Filter::Compare(c) => {
                if !out.contains(&c.column) {
                    out.push(c.column.clone());
                }
            }
            Filter::And(kids) | Filter::Or(kids) => {
                for k in kids {
                    k.columns(out)
                }
            }
            Filter::Negate(kid) => kid.columns(out),
        }
    }

    /// Render back to request lines, used when forwarding passthrough
    /// queries and sub-peer requests.
    pub fn render(&self, header: &str, out: &mut String) {
        match self {
            Filter::Compare(c) => {
                out.push_str(header);
                out.push_str(": ");
                out.push_str(&c.column);
                out.push(' ');
                out.push_str(c.op.as_str());
                if !c.value.is_empty() {
                    out.push(' ');
                    out.push_str(&c.value);
                }
                out.push('\n');
            }
            Filter::And(kids) => {
                for k in kids {
                    k.render(header, out);
                }
                out.push_str(&format!("{}And: {}\n", header_prefix(header), kids.len()));
            }
            Filter::Or(kids) => {
                for k in kids {
                    k.render(header, out);
                }
                out.push_str(&format!("{}Or: {}\n", header_prefix(header), kids.len()));
            }
            Filter::Negate(kid) => {
                kid.render(header, out);
                out.push_str(&format!("{}Negate:\n", header_prefix(header)));
            }
        }
    }
}

// Filter groups combine with bare And/Or/Negate lines; the other header
// families (Stats, WaitCondition) prefix the combinators with their name.
fn header_prefix(header: &str) -> &str {
    if header == "Filter" {
        ""
    } else {
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(col: &str, op: &str, value: &str) -> Comparison {
        Comparison::new(1, col, Op::parse(op).unwrap(), value).unwrap()
    }

    #[test]
    fn longest_operator_wins() {
        assert_eq!(Op::parse("!~~"), Some(Op::NoMatchNoCase));
        assert_eq!(Op::parse(">="), Some(Op::GreaterEqual));
        assert_eq!(Op::parse("~"), Some(Op::Match));
        assert_eq!(Op::parse("=="), None);
    }

    #[test]
    fn numeric_and_string_comparisons() {
        assert!(cmp("state", "=", "2").matches(&Value::Int(2)));
        assert!(cmp("state", ">=", "1").matches(&Value::Int(2)));
        assert!(!cmp("state", "<", "2").matches(&Value::Int(2)));
        assert!(cmp("name", "=", "web01").matches(&Value::Str("web01".into())));
        assert!(cmp("name", "!=", "web01").matches(&Value::Str("web02".into())));
    }

    #[test]
    fn regex_case_sensitivity() {
        assert!(cmp("name", "~", "^web").matches(&Value::Str("web01".into())));
        assert!(!cmp("name", "~", "^WEB").matches(&Value::Str("web01".into())));
        assert!(cmp("name", "~~", "^WEB").matches(&Value::Str("web01".into())));
        assert!(cmp("name", "!~~", "^db").matches(&Value::Str("web01".into())));
    }

    #[test]
    fn list_contains_semantics() {
        let groups = Value::StrList(vec!["linux".into(), "prod".into()]);
        assert!(cmp("groups", ">=", "prod").matches(&groups));
        assert!(cmp("groups", "<", "windows").matches(&groups));
        assert!(!cmp("groups", "=", "").matches(&groups));
        assert!(cmp("groups", "=", "").matches(&Value::StrList(vec![])));
    }

    #[test]
    fn nil_cells_match_only_negated_operators() {
        assert!(!cmp("missing", "=", "").matches(&Value::Nil));
        assert!(!cmp("missing", "=", "x").matches(&Value::Nil));
        assert!(!cmp("missing", "~", ".*").matches(&Value::Nil));
        assert!(!cmp("missing", ">=", "0").matches(&Value::Nil));
        assert!(cmp("missing", "!=", "x").matches(&Value::Nil));
        assert!(cmp("missing", "!~", "x").matches(&Value::Nil));
        assert!(cmp("missing", "!~~", "x").matches(&Value::Nil));
    }

    #[test]
    fn bitmask_operators_on_ints() {
        // 6 = 0b110
        assert!(cmp("modified_attributes", "~", "6").matches(&Value::Int(0b111)));
        assert!(!cmp("modified_attributes", "~", "6").matches(&Value::Int(0b101)));
        assert!(cmp("modified_attributes", "~~", "6").matches(&Value::Int(0b010)));
        assert!(cmp("modified_attributes", "!~~", "6").matches(&Value::Int(0b001)));
    }

    #[test]
    fn tree_evaluation_short_circuits_into_correct_result() {
        let f = Filter::And(vec![
            Filter::Compare(cmp("state", "=", "0")),
            Filter::Negate(Box::new(Filter::Compare(cmp("name", "~", "^db")))),
        ]);
        let get = |col: &str| -> Value {
            match col {
                "state" => Value::Int(0),
                "name" => Value::Str("web01".into()),
                _ => Value::Nil,
            }
        };
        assert!(f.matches(&get));
        let neg = Filter::Negate(Box::new(Filter::Negate(Box::new(f.clone()))));
        assert_eq!(neg.matches(&get), f.matches(&get));
    }

    #[test]
    fn render_round_trips_nested_groups() {
        let f = Filter::Or(vec![
            Filter::Compare(cmp("state", "=", "1")),
            Filter::Compare(cmp("state", "=", "2")),
        ]);
        let mut out = String::new();
        f.render("Filter", &mut out);
        assert_eq!(out, "Filter: state = 1\nFilter: state = 2\nOr: 2\n");
    }
}
