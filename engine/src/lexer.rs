// lexer.rs
use std::iter::Peekable;
use std::str::Chars;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Identifier(String),
    Operator(char),
    LeftParen,
    RightParen,
    Comma,
}

impl Token {
    /// True when a `+`/`-` following this token is a sign rather than a
    /// binary operator.
    fn opens_operand(previous: Option<&Token>) -> bool {
        matches!(
            previous,
            None | Some(Token::Operator(_)) | Some(Token::LeftParen) | Some(Token::Comma)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LexError {
    #[error("unexpected character '{character}' at position {position}")]
    UnexpectedCharacter { character: char, position: usize },
    #[error("unterminated comment starting at position {position}")]
    UnterminatedComment { position: usize },
}

pub struct Lexer<'a> {
    input: Peekable<Chars<'a>>,
    current_col: usize,
    previous: Option<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            input: source.chars().peekable(),
            current_col: 0,
            previous: None,
        }
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.input.next();
        if ch.is_some() {
            self.current_col += 1;
        }
        ch
    }

    fn peek(&mut self) -> Option<char> {
        self.input.peek().copied()
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') => {
                    // `/*` can only open a comment; a division is never followed by `*`.
                    let mut lookahead = self.input.clone();
                    lookahead.next();
                    if lookahead.peek() != Some(&'*') {
                        return Ok(());
                    }
                    let start = self.current_col + 1;
                    self.advance();
                    self.advance();
                    let mut last = None;
                    loop {
                        match self.advance() {
                            Some('/') if last == Some('*') => break,
                            Some(c) => last = Some(c),
                            None => return Err(LexError::UnterminatedComment { position: start }),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn lex_number(&mut self, first: char) -> Result<Token, LexError> {
        let position = self.current_col;
        let mut buf = String::new();
        buf.push(first);
        let mut seen_dot = first == '.';
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                buf.push(c);
                self.advance();
            } else if c == '.' && !seen_dot {
                seen_dot = true;
                buf.push(c);
                self.advance();
            } else {
                break;
            }
        }
        // a lone "." (or "-.") carries no digits
        if !buf.chars().any(|c| c.is_ascii_digit()) {
            return Err(LexError::UnexpectedCharacter {
                character: '.',
                position,
            });
        }
        buf.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| LexError::UnexpectedCharacter {
                character: first,
                position,
            })
    }

    fn lex_identifier(&mut self, first: char) -> Token {
        let mut buf = String::new();
        buf.push(first);
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                buf.push(c);
                self.advance();
            } else {
                break;
            }
        }
        Token::Identifier(buf)
    }

    pub fn next_token(&mut self) -> Result<Option<Token>, LexError> {
        self.skip_trivia()?;

        let Some(c) = self.advance() else {
            return Ok(None);
        };
        let position = self.current_col;

        let token = match c {
            '(' => Token::LeftParen,
            ')' => Token::RightParen,
            ',' => Token::Comma,
            '+' | '-'
                if Token::opens_operand(self.previous.as_ref())
                    && matches!(self.peek(), Some(n) if n.is_ascii_digit() || n == '.') =>
            {
                self.lex_number(c)?
            }
            '+' | '-' | '*' | '/' | '%' | '^' => Token::Operator(c),
            c if c.is_ascii_digit() || c == '.' => self.lex_number(c)?,
            c if c.is_ascii_alphabetic() || c == '_' => self.lex_identifier(c),
            _ => {
                return Err(LexError::UnexpectedCharacter {
                    character: c,
                    position,
                })
            }
        };

        self.previous = Some(token.clone());
        Ok(Some(token))
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token().transpose()
    }
}

/// Tokenize a formula whose placeholders have already been substituted.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).collect()
}
