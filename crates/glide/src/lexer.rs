use smallvec::smallvec;

use crate::{
    error::{ErrorKind, GlideError, RunResult},
    node::{Node, NodeRef, OpData, OpKind, Payload, TokenKind, make_bool, make_float, make_int, make_string},
};

/// Converts source text into the flat atom buffer the parser consumes.
///
/// Atoms are ordinary nodes: literals, identifiers, operator atoms and
/// bracket markers, bracketed by start-of-file and end-of-file sentinels.
pub(crate) struct Lexer {
    file_name: String,
    chars: Vec<char>,
    index: usize,
    line: u32,
    column: u32,
    atoms: Vec<NodeRef>,
}

impl Lexer {
    pub fn new(file_name: &str, source: &str) -> Self {
        Self {
            file_name: file_name.to_owned(),
            chars: source.chars().collect(),
            index: 0,
            line: 1,
            column: 1,
            atoms: Vec::new(),
        }
    }

    /// Tokenizes the whole source, returning the atom buffer.
    pub fn tokenize(mut self) -> RunResult<Vec<NodeRef>> {
        self.push_token(TokenKind::Sof);

        while let Some(ch) = self.peek() {
            match ch {
                ' ' | '\t' | '\r' => self.advance(),
                '\n' => {
                    self.advance();
                    self.line += 1;
                    self.column = 1;
                }
                '/' if self.peek_at(1) == Some('/') => self.skip_line_comment(),
                '"' => self.lex_string()?,
                c if c.is_ascii_digit() => self.lex_number()?,
                c if c.is_alphabetic() || c == '_' => self.lex_word(),
                _ => self.lex_operator()?,
            }
        }

        self.push_token(TokenKind::Eof);
        Ok(self.atoms)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.index + offset).copied()
    }

    fn advance(&mut self) {
        self.index += 1;
        self.column += 1;
    }

    fn push(&mut self, node: Node) {
        let node = node.at(self.line, self.column);
        self.atoms.push(node.into_ref());
    }

    fn push_token(&mut self, token: TokenKind) {
        self.push(Node::new(Payload::Token(token)));
    }

    fn push_op(&mut self, symbol: &str, op: OpKind) {
        let mut data = OpData::new(symbol, op);
        // prefix operators never take a left operand, so they must not
        // look like a partial-operator hole to the parser
        if matches!(op, OpKind::TripleDot | OpKind::Exclamation | OpKind::Hash) {
            data.is_binary = false;
        }
        self.push(Node::new(Payload::Op(data)));
        for _ in 0..symbol.chars().count() {
            self.advance();
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn lex_string(&mut self) -> RunResult<()> {
        let (start_line, start_column) = (self.line, self.column);
        self.advance();

        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(self.error_at(start_line, start_column, "Unterminated string literal"));
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    let escaped = match self.peek() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('\\') => '\\',
                        Some('"') => '"',
                        other => {
                            let shown = other.map_or(String::from("end of input"), |c| format!("'{c}'"));
                            return Err(self.error_at(start_line, start_column, &format!("Unknown escape {shown}")));
                        }
                    };
                    value.push(escaped);
                    self.advance();
                }
                Some(ch) => {
                    value.push(ch);
                    self.advance();
                }
            }
        }

        self.atoms
            .push(make_string(value, true).at(start_line, start_column).into_ref());
        Ok(())
    }

    fn lex_number(&mut self) -> RunResult<()> {
        let (start_line, start_column) = (self.line, self.column);
        let mut text = String::new();
        let mut is_float = false;

        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.advance();
            } else if ch == '.' && !is_float && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
                // A second dot is the range operator, not part of the number.
                is_float = true;
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        let node = if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.error_at(start_line, start_column, &format!("Malformed float literal '{text}'")))?;
            make_float(value, true)
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.error_at(start_line, start_column, &format!("Malformed integer literal '{text}'")))?;
            make_int(value, true)
        };

        self.atoms.push(node.at(start_line, start_column).into_ref());
        Ok(())
    }

    fn lex_word(&mut self) {
        let (start_line, start_column) = (self.line, self.column);
        let mut name = String::new();

        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                name.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        let node = match name.as_str() {
            "true" => make_bool(true, true),
            "false" => make_bool(false, true),
            _ => Node::new(Payload::Id { name, annotation: None }),
        };

        self.atoms.push(node.at(start_line, start_column).into_ref());
    }

    fn lex_operator(&mut self) -> RunResult<()> {
        let ch = self.peek().unwrap_or_default();
        let next = self.peek_at(1);
        let next2 = self.peek_at(2);

        match (ch, next, next2) {
            ('.', Some('.'), Some('.')) => self.push_op("...", OpKind::TripleDot),
            ('.', Some('.'), _) => self.push_op("..", OpKind::DoubleDot),
            ('=', Some('='), _) => self.push_op("==", OpKind::EqEq),
            ('=', Some('>'), _) => self.push_op("=>", OpKind::Arrow),
            ('!', Some('='), _) => self.push_op("!=", OpKind::NotEq),
            ('<', Some('='), _) => self.push_op("<=", OpKind::LtEq),
            ('>', Some('='), _) => self.push_op(">=", OpKind::GtEq),
            ('>', Some('>'), _) => self.push_op(">>", OpKind::Inject),
            ('&', Some('&'), _) => self.push_op("&&", OpKind::And),
            ('|', Some('|'), _) => self.push_op("||", OpKind::Or),
            (':', Some(':'), _) => self.push_op("::", OpKind::DoubleColon),
            ('+', Some('='), _) => self.push_op("+=", OpKind::PlusEq),
            ('-', Some('='), _) => self.push_op("-=", OpKind::MinusEq),
            ('+', _, _) => self.push_op("+", OpKind::Plus),
            ('-', _, _) => self.push_op("-", OpKind::Minus),
            ('*', _, _) => self.push_op("*", OpKind::Star),
            ('/', _, _) => self.push_op("/", OpKind::Slash),
            ('%', _, _) => self.push_op("%", OpKind::Percent),
            ('<', _, _) => self.push_op("<", OpKind::Lt),
            ('>', _, _) => self.push_op(">", OpKind::Gt),
            ('=', _, _) => self.push_op("=", OpKind::Equal),
            ('.', _, _) => self.push_op(".", OpKind::Dot),
            (':', _, _) => self.push_op(":", OpKind::Colon),
            (',', _, _) => self.push_op(",", OpKind::Comma),
            ('|', _, _) => self.push_op("|", OpKind::Pipe),
            (';', _, _) => self.push_op(";", OpKind::Semicolon),
            ('?', _, _) => self.push_op("?", OpKind::Question),
            ('!', _, _) => self.push_op("!", OpKind::Exclamation),
            ('#', _, _) => self.push_op("#", OpKind::Hash),
            ('(', _, _) => {
                self.push_token(TokenKind::LParen);
                self.advance();
            }
            (')', _, _) => {
                self.push_token(TokenKind::RParen);
                self.advance();
            }
            ('{', _, _) => {
                self.push_token(TokenKind::LBrace);
                self.advance();
            }
            ('}', _, _) => {
                self.push_token(TokenKind::RBrace);
                self.advance();
            }
            ('[', _, _) => {
                self.push_token(TokenKind::LBracket);
                self.advance();
            }
            (']', _, _) => {
                self.push_token(TokenKind::RBracket);
                self.advance();
            }
            _ => {
                return Err(self.error_at(self.line, self.column, &format!("Unexpected character '{ch}'")));
            }
        }

        Ok(())
    }

    fn error_at(&self, line: u32, column: u32, message: &str) -> crate::error::RunError {
        GlideError::new(
            ErrorKind::SyntaxError,
            smallvec![self.file_name.clone()],
            line,
            column,
            message.to_owned(),
        )
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;

    fn kinds(source: &str) -> Vec<NodeKind> {
        Lexer::new("test.gl", source)
            .tokenize()
            .unwrap()
            .iter()
            .map(|n| n.borrow().kind())
            .collect()
    }

    #[test]
    fn sentinels_wrap_the_stream() {
        let atoms = Lexer::new("test.gl", "1").tokenize().unwrap();
        assert!(atoms[0].borrow().is_token(TokenKind::Sof));
        assert!(atoms[2].borrow().is_token(TokenKind::Eof));
        assert_eq!(atoms[1].borrow().as_int(), Some(1));
    }

    #[test]
    fn numbers_and_ranges_disambiguate() {
        // "1..5" is int, range-op, int, not two floats.
        let atoms = Lexer::new("test.gl", "1..5").tokenize().unwrap();
        assert_eq!(atoms[1].borrow().as_int(), Some(1));
        assert_eq!(atoms[2].borrow().op_kind(), Some(OpKind::DoubleDot));
        assert_eq!(atoms[3].borrow().as_int(), Some(5));

        let atoms = Lexer::new("test.gl", "1.5").tokenize().unwrap();
        assert!(matches!(atoms[1].borrow().payload, Payload::Float(v) if (v - 1.5).abs() < f64::EPSILON));
    }

    #[test]
    fn multichar_operators() {
        let atoms = Lexer::new("test.gl", "a >= b >> f => :: ...rest").tokenize().unwrap();
        let ops: Vec<_> = atoms.iter().filter_map(|n| n.borrow().op_kind()).collect();
        assert_eq!(
            ops,
            vec![OpKind::GtEq, OpKind::Inject, OpKind::Arrow, OpKind::DoubleColon, OpKind::TripleDot]
        );
    }

    #[test]
    fn string_escapes() {
        let atoms = Lexer::new("test.gl", r#""a\nb\"c""#).tokenize().unwrap();
        assert_eq!(atoms[1].borrow().as_str(), Some("a\nb\"c"));
    }

    #[test]
    fn unterminated_string_is_a_syntax_error() {
        let err = Lexer::new("test.gl", "\"abc").tokenize().unwrap_err();
        assert!(err.to_string().contains("SyntaxError"));
        assert!(err.to_string().contains("Unterminated"));
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("1 // trailing\n2"),
            vec![NodeKind::Token, NodeKind::Int, NodeKind::Int, NodeKind::Token]
        );
    }

    #[test]
    fn words_lex_to_ids_and_bools() {
        let atoms = Lexer::new("test.gl", "xs true false _").tokenize().unwrap();
        assert_eq!(atoms[1].borrow().id_name(), Some("xs"));
        assert_eq!(atoms[2].borrow().as_bool(), Some(true));
        assert_eq!(atoms[3].borrow().as_bool(), Some(false));
        assert_eq!(atoms[4].borrow().id_name(), Some("_"));
    }
}
