//! Reader for the textual tree notation.
//!
//! ```text
//! ; a + b into a third local
//! (store (addr (local) 16)
//!        (add $a:(load (addr (local) 0) 8)
//!             (load (addr (local) 8) 8))
//!        8)
//! ```
//!
//! Every top-level form becomes a root. Inside a form, nested forms and
//! `$name` references are children and integers are arguments. `$name:`
//! before a form binds it so later references share the node.

use hashbrown::HashMap;

use crate::core::error::{JitError, JitResult};

use super::{ExprBuilder, ExprOp, ExprTree, NodeId};

/// Parse `text` into a tree and its roots.
pub fn parse_expr(text: &str) -> JitResult<(ExprTree, Vec<NodeId>)> {
    let mut parser = Parser::new(text);
    parser.parse()?;
    Ok(parser.builder.finish())
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    builder: ExprBuilder,
    bindings: HashMap<&'a str, NodeId>,
}

enum Operand {
    Child(NodeId),
    Arg(i64),
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            builder: ExprBuilder::new(),
            bindings: HashMap::new(),
        }
    }

    fn error(&self, message: impl std::fmt::Display) -> JitError {
        let start = self.pos.saturating_sub(20);
        let end = (self.pos + 20).min(self.text.len());
        JitError::unsupported(format!(
            "{} at offset {} near '{}'",
            message,
            self.pos,
            self.text.get(start..end).unwrap_or("")
        ))
    }

    fn parse(&mut self) -> JitResult<()> {
        self.skip_whitespace();
        while !self.is_eof() {
            let node = self.parse_node()?;
            self.builder.root(node);
            self.skip_whitespace();
        }
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            if ch == b';' {
                // Skip comment line
                while let Some(ch) = self.current() {
                    self.pos += 1;
                    if ch == b'\n' {
                        break;
                    }
                }
            } else if ch.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: u8) -> bool {
        self.skip_whitespace();
        if self.current() == Some(ch) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn read_word(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(ch) = self.current() {
            if ch.is_ascii_alphanumeric() || ch == b'_' || ch == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        &self.text[start..self.pos]
    }

    /// A form, or a `$name` reference, or a `$name:` binding.
    fn parse_node(&mut self) -> JitResult<NodeId> {
        self.skip_whitespace();
        if self.try_read(b'$') {
            let name = self.read_word();
            if name.is_empty() {
                return Err(self.error("expected name after '$'"));
            }
            if self.current() == Some(b':') {
                self.pos += 1;
                let node = self.parse_form()?;
                if self.bindings.insert(name, node).is_some() {
                    return Err(self.error(format_args!("${} bound twice", name)));
                }
                return Ok(node);
            }
            return self
                .bindings
                .get(name)
                .copied()
                .ok_or_else(|| self.error(format_args!("unbound reference ${}", name)));
        }
        self.parse_form()
    }

    fn parse_form(&mut self) -> JitResult<NodeId> {
        if !self.try_read(b'(') {
            return Err(self.error("expected '('"));
        }
        self.skip_whitespace();
        let name = self.read_word();
        let op = ExprOp::from_name(name).ok_or_else(|| self.error(format_args!("unknown operator '{}'", name)))?;

        let mut children = Vec::new();
        let mut args = Vec::new();
        loop {
            self.skip_whitespace();
            match self.current() {
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                None => return Err(self.error("unterminated form")),
                _ => match self.parse_operand()? {
                    Operand::Child(node) => children.push(node),
                    Operand::Arg(value) => args.push(value),
                },
            }
        }
        self.builder
            .node(op, &children, &args)
            .map_err(|e| self.error(e))
    }

    fn parse_operand(&mut self) -> JitResult<Operand> {
        match self.current() {
            Some(b'(') | Some(b'$') => Ok(Operand::Child(self.parse_node()?)),
            _ => Ok(Operand::Arg(self.parse_integer()?)),
        }
    }

    fn parse_integer(&mut self) -> JitResult<i64> {
        let negative = self.try_read(b'-');
        let word = self.read_word();
        let parsed = if let Some(hex) = word.strip_prefix("0x") {
            u64::from_str_radix(hex, 16).map(|v| v as i64)
        } else {
            word.parse::<i64>()
        };
        let value = parsed.map_err(|_| self.error(format_args!("expected integer, found '{}'", word)))?;
        Ok(if negative { value.wrapping_neg() } else { value })
    }
}
