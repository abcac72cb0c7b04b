//! OSC 1.0 message encoding.
//!
//! Only what the trigger device sends: a message with typed arguments.
//! Strings are NUL-terminated and padded to four bytes; numbers are
//! big-endian.

#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Float(f32),
    Str(String),
}

impl OscArg {
    fn type_tag(&self) -> char {
        match self {
            OscArg::Int(_) => 'i',
            OscArg::Float(_) => 'f',
            OscArg::Str(_) => 's',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: OscArg) -> Self {
        self.args.push(arg);
        self
    }

    /// The standard trigger: one float argument of 1.0.
    pub fn trigger(address: impl Into<String>) -> Self {
        Self::new(address).with_arg(OscArg::Float(1.0))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(padded_len(self.address.len()) + 8 + self.args.len() * 4);
        write_padded_str(&mut buf, &self.address);

        let tags: String = std::iter::once(',')
            .chain(self.args.iter().map(OscArg::type_tag))
            .collect();
        write_padded_str(&mut buf, &tags);

        for arg in &self.args {
            match arg {
                OscArg::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
                OscArg::Float(v) => buf.extend_from_slice(&v.to_be_bytes()),
                OscArg::Str(s) => write_padded_str(&mut buf, s),
            }
        }
        buf
    }
}

/// Length of a string including its terminator, rounded up to 4.
fn padded_len(len: usize) -> usize {
    (len + 4) & !3
}

fn write_padded_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    let padding = padded_len(s.len()) - s.len();
    buf.extend(std::iter::repeat_n(0u8, padding));
}
