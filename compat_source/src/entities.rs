use std::fmt;

// Entity lump text: a sequence of `{ "key" "value" ... }` blocks.

pub const CLASS_LANDMARK: &str = "info_landmark";
pub const CLASS_CHANGELEVEL: &str = "trigger_changelevel";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    UnexpectedToken { line: usize, token: String },
    UnterminatedString { line: usize },
    UnterminatedBlock { line: usize },
    MissingValue { line: usize, key: String },
}

impl fmt::Display for EntityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityError::UnexpectedToken { line, token } => {
                write!(f, "entity line {}: unexpected token {:?}", line, token)
            }
            EntityError::UnterminatedString { line } => {
                write!(f, "entity line {}: unterminated string", line)
            }
            EntityError::UnterminatedBlock { line } => {
                write!(f, "entity line {}: unterminated block", line)
            }
            EntityError::MissingValue { line, key } => {
                write!(f, "entity line {}: key {:?} has no value", line, key)
            }
        }
    }
}

impl std::error::Error for EntityError {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entity {
    pub pairs: Vec<(String, String)>,
}

impl Entity {
    /// First value stored under `key`. Keys compare case-insensitively, as
    /// the engine does.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn classname(&self) -> Option<&str> {
        self.get("classname")
    }

    pub fn origin(&self) -> Option<[f32; 3]> {
        parse_vector(self.get("origin")?)
    }
}

pub fn parse_vector(value: &str) -> Option<[f32; 3]> {
    let mut parts = value.split_whitespace().map(|part| part.parse::<f32>());
    let x = parts.next()?.ok()?;
    let y = parts.next()?.ok()?;
    let z = parts.next()?.ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some([x, y, z])
}

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Open,
    Close,
    Text(&'a str),
}

struct Lexer<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            line: 1,
        }
    }

    fn next_token(&mut self) -> Result<Option<Token<'a>>, EntityError> {
        let bytes = self.text.as_bytes();
        loop {
            while self.pos < bytes.len()
                && (bytes[self.pos].is_ascii_whitespace() || bytes[self.pos] == 0)
            {
                if bytes[self.pos] == b'\n' {
                    self.line += 1;
                }
                self.pos += 1;
            }
            if self.text[self.pos..].starts_with("//") {
                while self.pos < bytes.len() && bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            break;
        }
        if self.pos >= bytes.len() {
            return Ok(None);
        }
        match bytes[self.pos] {
            b'{' => {
                self.pos += 1;
                Ok(Some(Token::Open))
            }
            b'}' => {
                self.pos += 1;
                Ok(Some(Token::Close))
            }
            b'"' => {
                let start = self.pos + 1;
                let Some(len) = self.text[start..].find('"') else {
                    return Err(EntityError::UnterminatedString { line: self.line });
                };
                let value = &self.text[start..start + len];
                self.line += value.matches('\n').count();
                self.pos = start + len + 1;
                Ok(Some(Token::Text(value)))
            }
            _ => {
                let start = self.pos;
                while self.pos < bytes.len()
                    && !bytes[self.pos].is_ascii_whitespace()
                    && !matches!(bytes[self.pos], b'{' | b'}' | b'"')
                {
                    self.pos += 1;
                }
                Ok(Some(Token::Text(&self.text[start..self.pos])))
            }
        }
    }
}

pub fn parse_entities(text: &str) -> Result<Vec<Entity>, EntityError> {
    let mut lexer = Lexer::new(text);
    let mut entities = Vec::new();
    while let Some(token) = lexer.next_token()? {
        match token {
            Token::Open => entities.push(parse_block(&mut lexer)?),
            Token::Close => {
                return Err(EntityError::UnexpectedToken {
                    line: lexer.line,
                    token: "}".to_string(),
                })
            }
            Token::Text(text) => {
                return Err(EntityError::UnexpectedToken {
                    line: lexer.line,
                    token: text.to_string(),
                })
            }
        }
    }
    Ok(entities)
}

fn parse_block(lexer: &mut Lexer<'_>) -> Result<Entity, EntityError> {
    let mut entity = Entity::default();
    loop {
        let key = match lexer.next_token()? {
            Some(Token::Close) => return Ok(entity),
            Some(Token::Text(key)) => key,
            Some(Token::Open) => {
                return Err(EntityError::UnexpectedToken {
                    line: lexer.line,
                    token: "{".to_string(),
                })
            }
            None => return Err(EntityError::UnterminatedBlock { line: lexer.line }),
        };
        match lexer.next_token()? {
            Some(Token::Text(value)) => entity.pairs.push((key.to_string(), value.to_string())),
            _ => {
                return Err(EntityError::MissingValue {
                    line: lexer.line,
                    key: key.to_string(),
                })
            }
        }
    }
}
