use colored::*;

/// Token kinds of the NQ surface language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Name(String),
    Int(u32),
    Var,
    Func,
    If,
    Elif,
    Else,
    While,
    Return,
    Pass,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Assign,
    Star,
    Amp,
    Plus,
    Minus,
    Slash,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    Newline,
    Indent,
    Dedent,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

#[derive(Debug, Clone, Copy)]
enum Character {
    Whitespace,
    Alpha,
    Numeric,
    Value(char),
}

fn char_to_enum(character: char) -> Character {
    if character.is_numeric() {
        return Character::Numeric;
    }
    if character.is_alphabetic() || character == '_' {
        return Character::Alpha;
    }
    if character.is_whitespace() {
        return Character::Whitespace;
    }
    Character::Value(character)
}

/// A front-end diagnostic: what went wrong, where, and a colored excerpt of
/// the surrounding source for terminal display.
#[derive(Debug)]
pub struct ParseError {
    pub message: String,
    pub nice_message: String,
    pub row: usize,
    pub column: usize,
}

impl ParseError {
    pub(crate) fn new(message: String, text: &str, row: usize, column: usize) -> ParseError {
        let error_row_index = row.saturating_sub(1);
        let range = 3;
        let min = error_row_index.saturating_sub(range);
        let max = error_row_index + range;

        let mut nice_message = String::from("\n\n");
        for (row_index, row_text) in text.lines().enumerate() {
            if row_index > max {
                break;
            }
            if row_index < min {
                continue;
            }

            nice_message.push_str(&format!("{:>4}: ", row_index + 1).cyan().to_string());
            nice_message.push_str(&row_text.bright_white().to_string());
            nice_message.push('\n');

            if row_index == error_row_index {
                let indent = " ".repeat(column + 5);
                nice_message.push_str(&indent);
                nice_message.push_str(
                    &format!("^ parse error on row {} column {}", row, column)
                        .bright_red()
                        .to_string(),
                );
                nice_message.push('\n');
                nice_message.push_str(&indent);
                nice_message.push_str(&message.bright_red().to_string());
                nice_message.push('\n');
            }
        }
        nice_message.push('\n');

        ParseError {
            message,
            nice_message,
            row,
            column,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} at {}:{}", self.message, self.row, self.column)
    }
}

impl std::error::Error for ParseError {}

pub struct Lexer<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    indents: Vec<usize>,
    row: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(text: &'a str) -> Lexer<'a> {
        Lexer {
            text,
            tokens: Vec::new(),
            indents: vec![0],
            row: 0,
            column: 0,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        let lines: Vec<&str> = self.text.lines().collect();
        for (index, line) in lines.iter().enumerate() {
            self.row = index + 1;
            self.column = 0;
            self.tokenize_line(line)?;
        }
        // Close any blocks still open at the end of the file.
        self.row = lines.len();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent);
        }
        Ok(self.tokens)
    }

    fn push(&mut self, kind: TokenKind) {
        self.tokens.push(Token {
            kind,
            line: self.row,
        });
    }

    fn error<T>(&self, message: String) -> Result<T, ParseError> {
        Err(ParseError::new(message, self.text, self.row, self.column))
    }

    fn tokenize_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut indent = 0;
        let mut rest = line;
        loop {
            match rest.chars().next() {
                Some(' ') => {
                    indent += 1;
                    rest = &rest[1..];
                }
                Some('\t') => {
                    self.column = indent;
                    return self.error("tabs are not allowed in indentation".to_string());
                }
                _ => break,
            }
        }

        // Blank lines and comment-only lines do not affect indentation.
        if rest.is_empty() || rest.starts_with('#') {
            return Ok(());
        }

        self.column = indent;
        self.apply_indent(indent)?;
        self.scan(rest, indent)?;
        self.push(TokenKind::Newline);
        Ok(())
    }

    fn apply_indent(&mut self, indent: usize) -> Result<(), ParseError> {
        let current = *self.indents.last().unwrap();
        if indent > current {
            self.indents.push(indent);
            self.push(TokenKind::Indent);
        } else if indent < current {
            while *self.indents.last().unwrap() > indent {
                self.indents.pop();
                self.push(TokenKind::Dedent);
            }
            if *self.indents.last().unwrap() != indent {
                return self.error("unindent does not match an enclosing block".to_string());
            }
        }
        Ok(())
    }

    fn scan(&mut self, rest: &str, indent: usize) -> Result<(), ParseError> {
        let mut chars = rest.chars().peekable();
        let mut column = indent;

        while let Some(&character) = chars.peek() {
            self.column = column;
            match char_to_enum(character) {
                Character::Whitespace => {
                    chars.next();
                    column += 1;
                }
                Character::Value('#') => break,
                Character::Alpha => {
                    let mut word = String::new();
                    while let Some(&c) = chars.peek() {
                        match char_to_enum(c) {
                            Character::Alpha | Character::Numeric => {
                                word.push(c);
                                chars.next();
                                column += 1;
                            }
                            _ => break,
                        }
                    }
                    self.push(match word.as_str() {
                        "var" => TokenKind::Var,
                        "func" => TokenKind::Func,
                        "if" => TokenKind::If,
                        "elif" => TokenKind::Elif,
                        "else" => TokenKind::Else,
                        "while" => TokenKind::While,
                        "return" => TokenKind::Return,
                        "pass" => TokenKind::Pass,
                        _ => TokenKind::Name(word),
                    });
                }
                Character::Numeric => {
                    let mut digits = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_digit() {
                            digits.push(c);
                            chars.next();
                            column += 1;
                        } else {
                            break;
                        }
                    }
                    match digits.parse::<u32>() {
                        Ok(value) => self.push(TokenKind::Int(value)),
                        Err(_) => {
                            return self.error(format!("unable to parse integer \"{}\"", digits))
                        }
                    }
                }
                Character::Value('$') => {
                    chars.next();
                    column += 1;
                    let mut digits = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_hexdigit() {
                            digits.push(c);
                            chars.next();
                            column += 1;
                        } else {
                            break;
                        }
                    }
                    match u32::from_str_radix(&digits, 16) {
                        Ok(value) => self.push(TokenKind::Int(value)),
                        Err(_) => {
                            return self
                                .error(format!("unable to parse hex integer \"${}\"", digits))
                        }
                    }
                }
                Character::Value(value) => {
                    chars.next();
                    column += 1;
                    let kind = match value {
                        '(' => TokenKind::LParen,
                        ')' => TokenKind::RParen,
                        '[' => TokenKind::LBracket,
                        ']' => TokenKind::RBracket,
                        ':' => TokenKind::Colon,
                        ',' => TokenKind::Comma,
                        '*' => TokenKind::Star,
                        '&' => TokenKind::Amp,
                        '+' => TokenKind::Plus,
                        '-' => TokenKind::Minus,
                        '/' => TokenKind::Slash,
                        '=' => {
                            if chars.peek() == Some(&'=') {
                                chars.next();
                                column += 1;
                                TokenKind::Eq
                            } else {
                                TokenKind::Assign
                            }
                        }
                        '!' => {
                            if chars.peek() == Some(&'=') {
                                chars.next();
                                column += 1;
                                TokenKind::Neq
                            } else {
                                return self.error("expected \"=\" after \"!\"".to_string());
                            }
                        }
                        '<' => {
                            if chars.peek() == Some(&'=') {
                                chars.next();
                                column += 1;
                                TokenKind::Leq
                            } else {
                                TokenKind::Lt
                            }
                        }
                        '>' => {
                            if chars.peek() == Some(&'=') {
                                chars.next();
                                column += 1;
                                TokenKind::Geq
                            } else {
                                TokenKind::Gt
                            }
                        }
                        _ => {
                            return self.error(format!("unknown character \"{}\"", value));
                        }
                    };
                    self.push(kind);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        Lexer::new(text)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_simple_statement() {
        use TokenKind::*;
        assert_eq!(
            kinds("a = 2 + 3"),
            vec![Name("a".to_string()), Assign, Int(2), Plus, Int(3), Newline]
        );
    }

    #[test]
    fn test_hex_and_comments() {
        use TokenKind::*;
        assert_eq!(
            kinds("var b = $14  # twenty"),
            vec![Var, Name("b".to_string()), Assign, Int(0x14), Newline]
        );
    }

    #[test]
    fn test_indentation() {
        use TokenKind::*;
        assert_eq!(
            kinds("func main():\n    return 1\n"),
            vec![
                Func,
                Name("main".to_string()),
                LParen,
                RParen,
                Colon,
                Newline,
                Indent,
                Return,
                Int(1),
                Newline,
                Dedent,
            ]
        );
    }

    #[test]
    fn test_nested_dedents_close_at_eof() {
        use TokenKind::*;
        let tokens = kinds("func main():\n    if 1:\n        pass");
        let dedents = tokens.iter().filter(|k| **k == Dedent).count();
        assert_eq!(dedents, 2);
    }

    #[test]
    fn test_comparison_operators() {
        use TokenKind::*;
        assert_eq!(
            kinds("1 == 2 != 3 <= 4 >= 5 < 6 > 7"),
            vec![
                Int(1),
                Eq,
                Int(2),
                Neq,
                Int(3),
                Leq,
                Int(4),
                Geq,
                Int(5),
                Lt,
                Int(6),
                Gt,
                Int(7),
                Newline
            ]
        );
    }

    #[test]
    fn test_bad_unindent() {
        let result = Lexer::new("func main():\n    if 1:\n        pass\n   pass\n").tokenize();
        assert!(result.is_err());
    }

    #[test]
    fn test_blank_lines_ignored() {
        use TokenKind::*;
        assert_eq!(
            kinds("\n\nvar a\n\n# comment\nvar b\n"),
            vec![
                Var,
                Name("a".to_string()),
                Newline,
                Var,
                Name("b".to_string()),
                Newline
            ]
        );
    }
}
