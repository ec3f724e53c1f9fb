//! Message layer.
//!
//! Every frame carries one brine-encoded message:
//!
//! ```text
//! (kind: int, seq: int, payload)
//! ```
//!
//! A REQUEST payload is `(handler_code, boxed_args)`; REPLY and EXCEPTION
//! payloads are a boxed result and a vinegar-dumped exception respectively.
//! Objects inside payloads are boxed as `(label, data)` pairs, see [`BoxLabel`].

use crate::brine;
use crate::error::{Result, TetherError};
use crate::value::Value;
use std::fmt;

/// Kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request = 1,
    Reply = 2,
    Exception = 3,
}

impl MessageKind {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => MessageKind::Request,
            2 => MessageKind::Reply,
            3 => MessageKind::Exception,
            _ => return None,
        })
    }
}

/// Tags of boxed objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxLabel {
    /// Immutable value, copied.
    Value = 1,
    /// Tuple whose items are boxed individually.
    Tuple = 2,
    /// The receiver's own object, coming back home.
    LocalRef = 3,
    /// An object owned by the sender, identified by its id-pack.
    Proxy = 4,
}

impl BoxLabel {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => BoxLabel::Value,
            2 => BoxLabel::Tuple,
            3 => BoxLabel::LocalRef,
            4 => BoxLabel::Proxy,
            _ => return None,
        })
    }
}

macro_rules! handlers {
    ($($variant:ident = $code:literal => $name:literal),* $(,)?) => {
        /// Request handlers, identified by small integer codes on the wire.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Handler {
            $($variant = $code),*
        }

        impl Handler {
            pub const ALL: &'static [Handler] = &[$(Handler::$variant),*];

            pub fn code(self) -> i64 {
                self as i64
            }

            pub fn from_code(code: i64) -> Option<Self> {
                match code {
                    $($code => Some(Handler::$variant),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Handler::$variant => $name),*
                }
            }
        }
    };
}

handlers! {
    Ping = 1 => "PING",
    Close = 2 => "CLOSE",
    GetRoot = 3 => "GET_ROOT",
    GetAttr = 4 => "GETATTR",
    DelAttr = 5 => "DELATTR",
    SetAttr = 6 => "SETATTR",
    Call = 7 => "CALL",
    CallAttr = 8 => "CALLATTR",
    Repr = 9 => "REPR",
    Str = 10 => "STR",
    Cmp = 11 => "CMP",
    Hash = 12 => "HASH",
    Dir = 13 => "DIR",
    Pickle = 14 => "PICKLE",
    Del = 15 => "DEL",
    Inspect = 16 => "INSPECT",
    BuffIter = 17 => "BUFFITER",
    OldSlicing = 18 => "OLDSLICING",
    CtxExit = 19 => "CTXEXIT",
    InstanceCheck = 20 => "INSTANCECHECK",
    GetServiceAliases = 21 => "GET_SERVICE_ALIASES",
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub seq: u32,
    pub payload: Value,
}

impl Message {
    pub fn new(kind: MessageKind, seq: u32, payload: Value) -> Self {
        Self { kind, seq, payload }
    }

    pub fn request(seq: u32, handler: Handler, args: Value) -> Self {
        Self::new(
            MessageKind::Request,
            seq,
            Value::tuple([Value::from(handler.code()), args]),
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(brine::dump(&Value::tuple([
            Value::from(self.kind as i64),
            Value::from(self.seq),
            self.payload.clone(),
        ]))?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let value = brine::load(data)?;
        let invalid = || TetherError::Protocol(format!("invalid message: {}", value.repr()));
        let [kind, seq, payload] = value.as_tuple().ok_or_else(invalid)? else {
            return Err(invalid());
        };
        let kind = kind.as_i64().ok_or_else(invalid)?;
        let kind = MessageKind::from_code(kind)
            .ok_or_else(|| TetherError::Protocol(format!("invalid message kind: {}", kind)))?;
        let seq = seq
            .as_i64()
            .and_then(|s| u32::try_from(s).ok())
            .ok_or_else(invalid)?;
        Ok(Self {
            kind,
            seq,
            payload: payload.clone(),
        })
    }

    /// Split a REQUEST payload into its handler and argument box.
    pub fn request_parts(&self) -> Result<(Handler, &Value)> {
        let invalid = || TetherError::Protocol(format!("invalid request: {}", self.payload.repr()));
        let [code, args] = self.payload.as_tuple().ok_or_else(invalid)? else {
            return Err(invalid());
        };
        let code = code.as_i64().ok_or_else(invalid)?;
        let handler = Handler::from_code(code)
            .ok_or_else(|| TetherError::Protocol(format!("unknown handler code {}", code)))?;
        Ok((handler, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_codes_are_stable() {
        assert_eq!(Handler::Ping.code(), 1);
        assert_eq!(Handler::CallAttr.code(), 8);
        assert_eq!(Handler::GetServiceAliases.code(), 21);
        for handler in Handler::ALL {
            assert_eq!(Handler::from_code(handler.code()), Some(*handler));
        }
        assert_eq!(Handler::from_code(0), None);
        assert_eq!(Handler::from_code(22), None);
        assert_eq!(Handler::BuffIter.to_string(), "BUFFITER");
    }

    #[test]
    fn test_request_encoding() {
        let msg = Message::request(7, Handler::Ping, Value::from("hi"));
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        let (handler, args) = decoded.request_parts().unwrap();
        assert_eq!(handler, Handler::Ping);
        assert_eq!(args, &Value::from("hi"));
    }

    #[test]
    fn test_unknown_kind_and_handler() {
        let bad_kind = brine::dump(&Value::tuple([
            Value::from(9),
            Value::from(1),
            Value::None,
        ]))
        .unwrap();
        assert!(matches!(
            Message::decode(&bad_kind),
            Err(TetherError::Protocol(_))
        ));

        let msg = Message::new(
            MessageKind::Request,
            1,
            Value::tuple([Value::from(99), Value::None]),
        );
        assert!(matches!(
            msg.request_parts(),
            Err(TetherError::Protocol(_))
        ));
    }

    #[test]
    fn test_garbage_is_codec_error() {
        assert!(matches!(
            Message::decode(&[0xFF, 0xFF]),
            Err(TetherError::Codec(_))
        ));
    }
}
