/*!
 * ASCII command lines.
 *
 * A dialect fixes how a command word and its arguments are written, how the
 * reply line is split into fields and how the reply proves it belongs to the
 * command just sent. A reply that echoes some other command means the line
 * is out of step with the device and is reported as
 * [`CodecError::UnexpectedEcho`], never as a value.
 */
use std::ops::RangeInclusive;

use super::{Codec, Framing};
use crate::error::CodecError;

/// How a reply identifies the command it answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoStyle {
    /// First field equals the command word (`getpos:1500`)
    Word,
    /// First field equals the whole request line
    Line,
    /// Reply starts with the command's first letter upper-cased (`q` -> `Q180.0`)
    UppercaseInitial,
    /// No echo; framing only
    None,
}

/// Wire grammar of one ASCII protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiDialect {
    /// Appended to every request
    pub request_end: String,
    /// Last byte of every reply
    pub reply_end: u8,
    /// Between the command word and its arguments
    pub arg_separator: String,
    /// Between arguments
    pub arg_join: String,
    /// Between reply fields; a space means any run of whitespace
    pub field_separator: char,
    /// Sentinels that must enclose the reply body, if any
    pub reply_frame: Option<(String, String)>,
    /// Echo rule
    pub echo: EchoStyle,
}

impl AsciiDialect {
    /// `word arg1,arg2\n` answered by `word:field:field\n`
    pub fn word_echo() -> Self {
        Self {
            request_end: "\n".to_string(),
            reply_end: b'\n',
            arg_separator: " ".to_string(),
            arg_join: ",".to_string(),
            field_separator: ':',
            reply_frame: None,
            echo: EchoStyle::Word,
        }
    }

    /// Single lower-case letter commands answered by the upper-case letter and values
    pub fn letter_echo() -> Self {
        Self {
            request_end: "\n".to_string(),
            reply_end: b'\n',
            arg_separator: " ".to_string(),
            arg_join: " ".to_string(),
            field_separator: ' ',
            reply_frame: None,
            echo: EchoStyle::UppercaseInitial,
        }
    }

    /// Fixed-width commands with no terminator and plain line replies
    pub fn fixed_width() -> Self {
        Self {
            request_end: String::new(),
            reply_end: b'\n',
            arg_separator: String::new(),
            arg_join: String::new(),
            field_separator: '/',
            reply_frame: None,
            echo: EchoStyle::None,
        }
    }

    /// Enclose reply bodies in sentinels
    pub fn with_reply_frame<S1: Into<String>, S2: Into<String>>(mut self, open: S1, close: S2) -> Self {
        self.reply_frame = Some((open.into(), close.into()));
        self
    }

    /// Change the echo rule
    pub fn with_echo(mut self, echo: EchoStyle) -> Self {
        self.echo = echo;
        self
    }

    fn split(&self, body: &str) -> Vec<String> {
        if body.is_empty() {
            return Vec::new();
        }
        if self.field_separator == ' ' {
            body.split_whitespace().map(str::to_string).collect()
        } else {
            body.split(self.field_separator)
                .map(|f| f.trim().to_string())
                .collect()
        }
    }
}

/// One ASCII command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiCommand {
    /// Command word
    pub word: String,
    /// Arguments, already formatted
    pub args: Vec<String>,
}

impl AsciiCommand {
    /// Command without arguments
    pub fn new<S: Into<String>>(word: S) -> Self {
        Self {
            word: word.into(),
            args: Vec::new(),
        }
    }

    /// Add a formatted argument
    pub fn arg<T: ToString>(mut self, arg: T) -> Self {
        self.args.push(arg.to_string());
        self
    }

    fn line(&self, dialect: &AsciiDialect) -> String {
        if self.args.is_empty() {
            self.word.clone()
        } else {
            format!(
                "{}{}{}",
                self.word,
                dialect.arg_separator,
                self.args.join(&dialect.arg_join)
            )
        }
    }
}

/// Decoded reply fields, with the echo removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiReply {
    /// Raw reply line without terminator
    pub line: String,
    /// Value fields
    pub fields: Vec<String>,
}

impl AsciiReply {
    /// Field at `index`
    pub fn text(&self, index: usize, name: &str) -> Result<&str, CodecError> {
        self.fields
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| {
                CodecError::Malformed(format!(
                    "missing field {} ({}) in {:?}",
                    index, name, self.line
                ))
            })
    }

    /// Integer field, checked against its physical range
    pub fn int(&self, index: usize, name: &str, range: RangeInclusive<i64>) -> Result<i64, CodecError> {
        let raw = self.text(index, name)?;
        let value: i64 = raw
            .parse()
            .map_err(|_| CodecError::Malformed(format!("{} is not an integer: {:?}", name, raw)))?;
        if !range.contains(&value) {
            return Err(CodecError::OutOfRange {
                field: name.to_string(),
                value: raw.to_string(),
            });
        }
        Ok(value)
    }

    /// Float field, checked against its physical range.
    ///
    /// Parsing is locale-independent: only `.` is a decimal point. NaN and
    /// infinities are rejected.
    pub fn float(&self, index: usize, name: &str, range: RangeInclusive<f64>) -> Result<f64, CodecError> {
        let raw = self.text(index, name)?;
        let value: f64 = raw
            .parse()
            .map_err(|_| CodecError::Malformed(format!("{} is not a number: {:?}", name, raw)))?;
        if !value.is_finite() {
            return Err(CodecError::Malformed(format!("{} is not finite: {:?}", name, raw)));
        }
        if !range.contains(&value) {
            return Err(CodecError::OutOfRange {
                field: name.to_string(),
                value: raw.to_string(),
            });
        }
        Ok(value)
    }

    /// `0`/`1` flag field
    pub fn flag(&self, index: usize, name: &str) -> Result<bool, CodecError> {
        Ok(self.int(index, name, 0..=1)? == 1)
    }
}

/// Codec for one ASCII dialect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiCodec {
    dialect: AsciiDialect,
}

impl AsciiCodec {
    /// Create a codec for a dialect
    pub fn new(dialect: AsciiDialect) -> Self {
        Self { dialect }
    }

    /// The dialect in use
    pub fn dialect(&self) -> &AsciiDialect {
        &self.dialect
    }
}

impl Codec for AsciiCodec {
    type Command = AsciiCommand;
    type Reply = AsciiReply;

    fn encode(&self, command: &AsciiCommand) -> Result<Vec<u8>, CodecError> {
        let line = command.line(&self.dialect);
        if line.contains(self.dialect.reply_end as char) {
            return Err(CodecError::Malformed(format!(
                "command contains the line terminator: {:?}",
                line
            )));
        }
        Ok(format!("{}{}", line, self.dialect.request_end).into_bytes())
    }

    fn decode(&self, command: &AsciiCommand, raw: &[u8]) -> Result<AsciiReply, CodecError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| CodecError::Malformed("reply is not ASCII".to_string()))?;
        let line = text
            .strip_suffix(self.dialect.reply_end as char)
            .unwrap_or(text)
            .trim_end_matches('\r')
            .trim();

        let body = match &self.dialect.reply_frame {
            Some((open, close)) => line
                .strip_prefix(open.as_str())
                .and_then(|b| b.strip_suffix(close.as_str()))
                .ok_or_else(|| {
                    CodecError::Malformed(format!("expected {}...{} around {:?}", open, close, line))
                })?,
            None => line,
        };

        let fields = match self.dialect.echo {
            EchoStyle::Word | EchoStyle::Line => {
                let expected = match self.dialect.echo {
                    EchoStyle::Word => command.word.clone(),
                    _ => command.line(&self.dialect),
                };
                let mut fields = self.dialect.split(body);
                if fields.is_empty() || fields[0] != expected {
                    return Err(CodecError::UnexpectedEcho {
                        expected,
                        actual: fields.first().cloned().unwrap_or_default(),
                    });
                }
                fields.remove(0);
                fields
            }
            EchoStyle::UppercaseInitial => {
                let expected = command
                    .word
                    .chars()
                    .next()
                    .map(|c| c.to_ascii_uppercase())
                    .ok_or_else(|| CodecError::Malformed("empty command word".to_string()))?;
                let mut chars = body.chars();
                match chars.next() {
                    Some(c) if c == expected => self.dialect.split(chars.as_str().trim()),
                    other => {
                        return Err(CodecError::UnexpectedEcho {
                            expected: expected.to_string(),
                            actual: other.map(String::from).unwrap_or_default(),
                        })
                    }
                }
            }
            EchoStyle::None => self.dialect.split(body),
        };

        Ok(AsciiReply {
            line: line.to_string(),
            fields,
        })
    }

    fn framing(&self) -> Framing {
        Framing::Terminated(self.dialect.reply_end)
    }
}
