//! Best-effort recovery of syntactically damaged JSON text
//!
//! Repair only fixes syntax: unbalanced braces, unterminated strings,
//! trailing commas, code fences and commentary around the document. It never
//! changes the type of a value, so the strict schema check that follows still
//! decides whether the result is usable.

use serde_json::Value;

use crate::error::{Error, Result};

/// Turns broken JSON text into a parsed value, or fails
pub trait JsonRepair: Send + Sync {
    fn repair(&self, text: &str) -> Result<Value>;
}

/// Single-pass scanner that balances brackets and trims damage
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicRepair;

impl JsonRepair for HeuristicRepair {
    fn repair(&self, text: &str) -> Result<Value> {
        let body = extract_body(text)
            .ok_or_else(|| Error::Repair("no JSON object or array found".to_string()))?;

        let scan = Scan::run(body);

        let completed = scan.complete();
        if let Ok(value) = serde_json::from_str(&completed) {
            return Ok(value);
        }

        // fall back to the last point where a whole element had been written
        if let Some(truncated) = scan.truncated_at_last_cut() {
            if let Ok(value) = serde_json::from_str(&truncated) {
                return Ok(value);
            }
        }

        Err(Error::Repair("text could not be balanced into valid JSON".to_string()))
    }
}

/// Strip markdown fences and any prose before the first `{` or `[`
fn extract_body(text: &str) -> Option<&str> {
    let mut body = text;
    if let Some(fence) = body.find("```") {
        let after = &body[fence + 3..];
        // skip the info string (`json`) on the fence line
        let after = after.find('\n').map_or(after, |nl| &after[nl + 1..]);
        body = after.find("```").map_or(after, |end| &after[..end]);
    }
    let start = body.find(['{', '['])?;
    Some(&body[start..])
}

struct Scan {
    out: String,
    /// Closers still owed, innermost last
    stack: Vec<char>,
    in_string: bool,
    escape: bool,
    /// Length of `out` and the owed closers just before the last comma
    last_cut: Option<(usize, Vec<char>)>,
}

impl Scan {
    fn run(body: &str) -> Self {
        let mut scan = Scan {
            out: String::with_capacity(body.len() + 8),
            stack: Vec::new(),
            in_string: false,
            escape: false,
            last_cut: None,
        };

        for c in body.chars() {
            if scan.in_string {
                scan.out.push(c);
                if scan.escape {
                    scan.escape = false;
                } else if c == '\\' {
                    scan.escape = true;
                } else if c == '"' {
                    scan.in_string = false;
                }
                continue;
            }

            match c {
                '"' => {
                    scan.in_string = true;
                    scan.out.push(c);
                }
                '{' => {
                    scan.stack.push('}');
                    scan.out.push(c);
                }
                '[' => {
                    scan.stack.push(']');
                    scan.out.push(c);
                }
                '}' | ']' => {
                    if !scan.stack.contains(&c) {
                        continue;
                    }
                    scan.trim_trailing_comma();
                    // close any inner containers the text forgot to close
                    while let Some(closer) = scan.stack.pop() {
                        scan.out.push(closer);
                        if closer == c {
                            break;
                        }
                    }
                    if scan.stack.is_empty() {
                        break;
                    }
                }
                ',' => {
                    scan.last_cut = Some((scan.out.len(), scan.stack.clone()));
                    scan.out.push(c);
                }
                _ => scan.out.push(c),
            }
        }

        scan
    }

    fn trim_trailing_comma(&mut self) {
        let trimmed = self.out.trim_end().len();
        self.out.truncate(trimmed);
        if self.out.ends_with(',') {
            self.out.pop();
        }
    }

    /// Close whatever is still open at the end of the text
    fn complete(&self) -> String {
        let mut out = self.out.clone();
        if self.in_string {
            if self.escape {
                out.pop();
            }
            out.push('"');
        }

        let trimmed = out.trim_end().len();
        out.truncate(trimmed);
        if out.ends_with(',') {
            out.pop();
        }
        if out.ends_with(':') {
            out.push_str("null");
        }

        out.extend(self.stack.iter().rev());
        out
    }

    fn truncated_at_last_cut(&self) -> Option<String> {
        let (len, stack) = self.last_cut.as_ref()?;
        let mut out = self.out[..*len].to_string();
        out.extend(stack.iter().rev());
        Some(out)
    }
}
