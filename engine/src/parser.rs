// parser.rs
// -----------------------------------------------------------------------------
// Shunting-yard compiler: infix token stream -> postfix instruction sequence.
// -----------------------------------------------------------------------------
// Function calls are tracked per parenthesis so every `Function` instruction
// carries the number of comma-separated arguments it was written with. The
// evaluator never has to guess how many operands a variadic call consumes.
// -----------------------------------------------------------------------------

use crate::calculation::FnId;
use crate::lexer::Token;
use std::iter::Peekable;
use std::slice::Iter;
use thiserror::Error;

/* ------------------------------- Op codes -------------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    /// Prefix `-` applied to a parenthesised group or a function call.
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Associativity {
    Left,
    Right,
}

impl OpCode {
    pub fn from_char(c: char) -> Option<Self> {
        use OpCode::*;
        match c {
            '+' => Some(Add),
            '-' => Some(Subtract),
            '*' => Some(Multiply),
            '/' => Some(Divide),
            '%' => Some(Modulo),
            '^' => Some(Power),
            _ => None,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            OpCode::Add => '+',
            OpCode::Subtract | OpCode::Negate => '-',
            OpCode::Multiply => '*',
            OpCode::Divide => '/',
            OpCode::Modulo => '%',
            OpCode::Power => '^',
        }
    }

    pub fn precedence(&self) -> u8 {
        match self {
            OpCode::Add | OpCode::Subtract => 1,
            OpCode::Multiply | OpCode::Divide | OpCode::Modulo => 2,
            OpCode::Power | OpCode::Negate => 3,
        }
    }

    pub fn associativity(&self) -> Associativity {
        match self {
            OpCode::Power | OpCode::Negate => Associativity::Right,
            _ => Associativity::Left,
        }
    }

    pub fn is_unary(&self) -> bool {
        matches!(self, OpCode::Negate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PostfixInstruction {
    Number(f64),
    Operator(OpCode),
    Function { id: FnId, argc: usize },
}

/* ------------------------------ CompileError ----------------------------- */

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("mismatched parentheses")]
    MismatchedParentheses,
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{0}' must be followed by '('")]
    MissingCallParentheses(String),
    #[error("',' is only allowed between function arguments")]
    UnexpectedComma,
    #[error("empty argument in call to '{0}'")]
    EmptyArgument(&'static str),
    #[error("empty parentheses outside a function call")]
    EmptyGroup,
}

/* -------------------------------- Parser -------------------------------- */

enum StackEntry {
    Operator(OpCode),
    Function(FnId),
    LeftParen,
}

/// One open parenthesis. `call` is set when the paren opens a function's
/// argument list.
struct ParenFrame {
    call: Option<FnId>,
    commas: usize,
    arg_has_content: bool,
}

pub struct Parser<'a> {
    iter: Peekable<Iter<'a, Token>>,
    output: Vec<PostfixInstruction>,
    stack: Vec<StackEntry>,
    parens: Vec<ParenFrame>,
    previous: Option<&'a Token>,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Self {
            iter: tokens.iter().peekable(),
            output: Vec::with_capacity(tokens.len()),
            stack: Vec::new(),
            parens: Vec::new(),
            previous: None,
        }
    }

    // Entry point
    pub fn compile(mut self) -> Result<Vec<PostfixInstruction>, CompileError> {
        while let Some(token) = self.iter.next() {
            if !matches!(token, Token::RightParen | Token::Comma) {
                if let Some(frame) = self.parens.last_mut() {
                    frame.arg_has_content = true;
                }
            }

            match token {
                Token::Number(n) => self.output.push(PostfixInstruction::Number(*n)),
                Token::Identifier(name) => self.push_function(name)?,
                Token::Operator(c) => self.push_operator(*c)?,
                Token::LeftParen => self.open_paren(),
                Token::RightParen => self.close_paren()?,
                Token::Comma => self.separate_argument()?,
            }

            self.previous = Some(token);
        }

        while let Some(entry) = self.stack.pop() {
            match entry {
                StackEntry::Operator(op) => self.output.push(PostfixInstruction::Operator(op)),
                StackEntry::Function(_) | StackEntry::LeftParen => {
                    return Err(CompileError::MismatchedParentheses)
                }
            }
        }

        Ok(self.output)
    }

    /* --------------------------- token handlers ------------------------- */

    fn push_function(&mut self, name: &str) -> Result<(), CompileError> {
        let id = FnId::from_name(name)
            .ok_or_else(|| CompileError::UnknownFunction(name.to_string()))?;
        match self.iter.peek() {
            Some(Token::LeftParen) => {
                self.stack.push(StackEntry::Function(id));
                Ok(())
            }
            _ => Err(CompileError::MissingCallParentheses(name.to_string())),
        }
    }

    fn in_operand_position(&self) -> bool {
        matches!(
            self.previous,
            None | Some(Token::Operator(_)) | Some(Token::LeftParen) | Some(Token::Comma)
        )
    }

    fn push_operator(&mut self, c: char) -> Result<(), CompileError> {
        // The lexer only emits operator chars it knows.
        let Some(op) = OpCode::from_char(c) else {
            return Ok(());
        };

        if self.in_operand_position() {
            match op {
                OpCode::Subtract => {
                    self.stack.push(StackEntry::Operator(OpCode::Negate));
                    return Ok(());
                }
                OpCode::Add => return Ok(()),
                // anything else gets reported by the evaluator as missing operands
                _ => {}
            }
        }

        while let Some(StackEntry::Operator(top)) = self.stack.last() {
            let pops = top.precedence() > op.precedence()
                || (top.precedence() == op.precedence()
                    && op.associativity() == Associativity::Left);
            if !pops {
                break;
            }
            self.output.push(PostfixInstruction::Operator(*top));
            self.stack.pop();
        }
        self.stack.push(StackEntry::Operator(op));
        Ok(())
    }

    fn open_paren(&mut self) {
        let call = match self.stack.last() {
            Some(StackEntry::Function(id)) => Some(*id),
            _ => None,
        };
        self.stack.push(StackEntry::LeftParen);
        self.parens.push(ParenFrame {
            call,
            commas: 0,
            arg_has_content: false,
        });
    }

    /// Pop operators to the output until a `(` is on top of the stack.
    fn drain_to_paren(&mut self) -> Result<(), CompileError> {
        loop {
            match self.stack.last() {
                Some(StackEntry::Operator(op)) => {
                    self.output.push(PostfixInstruction::Operator(*op));
                    self.stack.pop();
                }
                Some(StackEntry::LeftParen) => return Ok(()),
                Some(StackEntry::Function(_)) | None => {
                    return Err(CompileError::MismatchedParentheses)
                }
            }
        }
    }

    fn close_paren(&mut self) -> Result<(), CompileError> {
        self.drain_to_paren()?;
        self.stack.pop();
        let frame = self
            .parens
            .pop()
            .ok_or(CompileError::MismatchedParentheses)?;

        let Some(id) = frame.call else {
            return if frame.arg_has_content {
                Ok(())
            } else {
                Err(CompileError::EmptyGroup)
            };
        };
        if frame.commas > 0 && !frame.arg_has_content {
            return Err(CompileError::EmptyArgument(id.name()));
        }
        let argc = if frame.arg_has_content {
            frame.commas + 1
        } else {
            0
        };
        if let Some(StackEntry::Function(_)) = self.stack.last() {
            self.stack.pop();
        }
        self.output.push(PostfixInstruction::Function { id, argc });
        Ok(())
    }

    fn separate_argument(&mut self) -> Result<(), CompileError> {
        self.drain_to_paren()?;
        let frame = self
            .parens
            .last_mut()
            .ok_or(CompileError::MismatchedParentheses)?;
        let Some(id) = frame.call else {
            return Err(CompileError::UnexpectedComma);
        };
        if !frame.arg_has_content {
            return Err(CompileError::EmptyArgument(id.name()));
        }
        frame.commas += 1;
        frame.arg_has_content = false;
        Ok(())
    }
}

/// Compile a token stream into postfix order.
pub fn compile(tokens: &[Token]) -> Result<Vec<PostfixInstruction>, CompileError> {
    Parser::new(tokens).compile()
}

/* ======================= UNIT TESTS ======================= */
