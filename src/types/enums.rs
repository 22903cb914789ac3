//! `Enum8` / `Enum16` name-to-code mappings.

use crate::error::{ChResult, ProtocolError};
use std::collections::HashMap;
use std::fmt;

/// Parsed `'name' = code` pairs of an enum type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumMapping {
    entries: Vec<(String, i16)>,
    by_name: HashMap<String, i16>,
    by_code: HashMap<i16, usize>,
}

impl EnumMapping {
    pub fn new(entries: Vec<(String, i16)>) -> Self {
        let by_name = entries.iter().map(|(n, c)| (n.clone(), *c)).collect();
        let by_code = entries
            .iter()
            .enumerate()
            .map(|(i, (_, c))| (*c, i))
            .collect();
        Self {
            entries,
            by_name,
            by_code,
        }
    }

    /// Parse the arguments of `Enum8(...)`, e.g. `'debug' = 1, 'info' = 2`.
    pub fn parse(args: &str) -> ChResult<Self> {
        let err = |msg: &str| ProtocolError::UnsupportedType(format!("Enum({}): {}", args, msg));
        let chars: Vec<char> = args.chars().collect();
        let mut entries = Vec::new();
        let mut i = 0;

        let skip_ws = |i: &mut usize| {
            while *i < chars.len() && chars[*i].is_whitespace() {
                *i += 1;
            }
        };

        loop {
            skip_ws(&mut i);
            if i >= chars.len() {
                break;
            }
            if chars[i] != '\'' {
                return Err(err("expected quoted name").into());
            }
            i += 1;

            let mut name = String::new();
            loop {
                match chars.get(i) {
                    None => return Err(err("unterminated name").into()),
                    Some('\\') => {
                        if let Some(c) = chars.get(i + 1) {
                            name.push(*c);
                        }
                        i += 2;
                    }
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(c) => {
                        name.push(*c);
                        i += 1;
                    }
                }
            }

            skip_ws(&mut i);
            if chars.get(i) != Some(&'=') {
                return Err(err("expected '='").into());
            }
            i += 1;
            skip_ws(&mut i);

            let start = i;
            if chars.get(i) == Some(&'-') {
                i += 1;
            }
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let code: String = chars[start..i].iter().collect();
            let code: i16 = code.parse().map_err(|_| err("invalid code"))?;
            entries.push((name, code));

            skip_ws(&mut i);
            match chars.get(i) {
                None => break,
                Some(',') => i += 1,
                Some(_) => return Err(err("expected ','").into()),
            }
        }

        if entries.is_empty() {
            return Err(err("no values").into());
        }
        Ok(Self::new(entries))
    }

    pub fn code(&self, name: &str) -> Option<i16> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, code: i16) -> Option<&str> {
        self.by_code
            .get(&code)
            .map(|&i| self.entries[i].0.as_str())
    }

    /// Code used for rows without a value.
    pub fn default_code(&self) -> i16 {
        self.entries.first().map(|(_, c)| *c).unwrap_or(0)
    }

    pub fn entries(&self) -> &[(String, i16)] {
        &self.entries
    }
}

impl fmt::Display for EnumMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, code)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "'{}' = {}", name.replace('\\', "\\\\").replace('\'', "\\'"), code)?;
        }
        Ok(())
    }
}
