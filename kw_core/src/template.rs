//! `{placeholder}` expansion for declaration strings.
//!
//! `{{` and `}}` produce literal braces. Unknown placeholders and unbalanced
//! braces are declaration errors rather than being passed through, so a typo
//! never ends up written into an installed file.

use std::collections::BTreeMap;

use crate::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vars {
    package: String,
    values: BTreeMap<String, String>,
}

impl Vars {
    pub fn new(package: &str) -> Self {
        Self {
            package: package.to_string(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn expand(&self, template: &str) -> Result<String, Error> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if chars.peek().map(|(_, c)| *c) == Some('{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek().map(|(_, c)| *c) == Some('}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut key = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        key.push(c);
                    }
                    if !closed {
                        return Err(self.error(template, format!("unclosed '{{' at byte {pos}")));
                    }
                    match self.values.get(&key) {
                        Some(value) => out.push_str(value),
                        None => {
                            return Err(
                                self.error(template, format!("unknown placeholder '{{{key}}}'"))
                            );
                        }
                    }
                }
                '}' => {
                    return Err(self.error(template, format!("unmatched '}}' at byte {pos}")));
                }
                _ => out.push(c),
            }
        }

        Ok(out)
    }

    pub fn expand_all(&self, templates: &[String]) -> Result<Vec<String>, Error> {
        templates.iter().map(|t| self.expand(t)).collect()
    }

    pub fn expand_map(
        &self,
        templates: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, Error> {
        templates
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.expand(v)?)))
            .collect()
    }

    fn error(&self, template: &str, message: String) -> Error {
        Error::InvalidPackage {
            name: self.package.clone(),
            message: format!("{message} in '{template}'"),
        }
    }
}
