//! `comp_algorithm` attribute model
//!
//! The kernel exposes the attribute as every supported algorithm on one line,
//! with the current selection in square brackets:
//!
//! ```text
//! lzo lzo-rle [lz4] zstd
//! ```

use serde::Serialize;
use std::fmt;

use crate::error::{Result, ZramError};

/// Current compression algorithm together with the kernel's supported set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompAlgorithm {
    selected: String,
    supported: Vec<String>,
}

impl CompAlgorithm {
    pub fn parse(content: &str) -> Result<Self> {
        let mut selected = None;
        let mut supported = Vec::new();

        for token in content.split_whitespace() {
            match token.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
                Some(name) if !name.is_empty() => {
                    if selected.is_some() {
                        return Err(ZramError::Parse(format!(
                            "More than one selected algorithm in {:?}",
                            content.trim()
                        )));
                    }
                    selected = Some(name.to_string());
                    supported.push(name.to_string());
                }
                Some(_) => {
                    return Err(ZramError::Parse(format!(
                        "Empty selection in {:?}",
                        content.trim()
                    )))
                }
                None => supported.push(token.to_string()),
            }
        }

        let selected = selected.ok_or_else(|| {
            ZramError::Parse(format!("No selected algorithm in {:?}", content.trim()))
        })?;

        Ok(Self {
            selected,
            supported,
        })
    }

    pub fn selected(&self) -> &str {
        &self.selected
    }

    pub fn supported(&self) -> &[String] {
        &self.supported
    }

    pub fn supports(&self, name: &str) -> bool {
        self.supported.iter().any(|s| s == name)
    }
}

impl fmt::Display for CompAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .supported
            .iter()
            .map(|s| {
                if *s == self.selected {
                    format!("[{}]", s)
                } else {
                    s.clone()
                }
            })
            .collect();
        write!(f, "{}", rendered.join(" "))
    }
}
