//! KRPC message model: the tagged {Query, Response, Error} envelope carried
//! over Bencode.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::bencode::Value;
use crate::error::Error;

pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_SERVER: i64 = 202;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_UNKNOWN_METHOD: i64 = 204;

/// A decoded or to-be-encoded KRPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Query {
        tid: Bytes,
        method: Bytes,
        args: BTreeMap<Bytes, Value>,
    },
    Response {
        tid: Bytes,
        values: BTreeMap<Bytes, Value>,
    },
    Error {
        tid: Bytes,
        code: i64,
        message: String,
    },
}

impl Message {
    pub fn tid(&self) -> &Bytes {
        match self {
            Message::Query { tid, .. } => tid,
            Message::Response { tid, .. } => tid,
            Message::Error { tid, .. } => tid,
        }
    }

    pub fn error(tid: Bytes, code: i64, message: impl Into<String>) -> Self {
        Message::Error {
            tid,
            code,
            message: message.into(),
        }
    }

    /// Builds an error reply from a runtime [`Error`], mapping it onto the
    /// KRPC error-code taxonomy.
    pub fn error_from(tid: Bytes, err: &Error) -> Self {
        Message::error(tid, err.krpc_code(), err.to_string())
    }

    pub fn to_value(&self) -> Value {
        let mut dict = BTreeMap::new();
        match self {
            Message::Query { tid, method, args } => {
                dict.insert(key("t"), Value::Bytes(tid.clone()));
                dict.insert(key("y"), Value::str("q"));
                dict.insert(key("q"), Value::Bytes(method.clone()));
                dict.insert(key("a"), Value::Dict(args.clone()));
            }
            Message::Response { tid, values } => {
                dict.insert(key("t"), Value::Bytes(tid.clone()));
                dict.insert(key("y"), Value::str("r"));
                dict.insert(key("r"), Value::Dict(values.clone()));
            }
            Message::Error { tid, code, message } => {
                dict.insert(key("t"), Value::Bytes(tid.clone()));
                dict.insert(key("y"), Value::str("e"));
                dict.insert(
                    key("e"),
                    Value::List(vec![Value::Int(*code), Value::str(message)]),
                );
            }
        }
        Value::Dict(dict)
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_value().encode()
    }

    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let dict = value
            .as_dict()
            .map_err(|_| Error::Protocol("message is not a dict".into()))?;

        let tid = lookup(dict, "t")?
            .as_bytes()
            .map_err(|_| Error::Protocol("'t' is not a byte string".into()))?
            .clone();
        let y = lookup(dict, "y")?
            .as_bytes()
            .map_err(|_| Error::Protocol("'y' is not a byte string".into()))?;

        match y.as_ref() {
            b"q" => {
                let method = lookup(dict, "q")?
                    .as_bytes()
                    .map_err(|_| Error::Protocol("'q' is not a byte string".into()))?
                    .clone();
                let args = lookup(dict, "a")?
                    .as_dict()
                    .map_err(|_| Error::Protocol("'a' is not a dict".into()))?
                    .clone();
                Ok(Message::Query { tid, method, args })
            }
            b"r" => {
                let values = lookup(dict, "r")?
                    .as_dict()
                    .map_err(|_| Error::Protocol("'r' is not a dict".into()))?
                    .clone();
                Ok(Message::Response { tid, values })
            }
            b"e" => {
                let items = lookup(dict, "e")?
                    .as_list()
                    .map_err(|_| Error::Protocol("'e' is not a list".into()))?;
                if items.len() != 2 {
                    return Err(Error::Protocol(format!(
                        "'e' must have exactly 2 elements, got {}",
                        items.len()
                    )));
                }
                let code = items[0]
                    .as_int()
                    .map_err(|_| Error::Protocol("error code is not an integer".into()))?;
                let message = items[1]
                    .as_bytes()
                    .map_err(|_| Error::Protocol("error message is not a byte string".into()))?;
                let message = String::from_utf8_lossy(message).into_owned();
                Ok(Message::Error {
                    tid,
                    code,
                    message,
                })
            }
            other => Err(Error::Protocol(format!(
                "unrecognized 'y' value {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let (value, _) = Value::decode(bytes)?;
        Message::from_value(&value)
    }
}

fn key(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn lookup<'a>(
    dict: &'a BTreeMap<Bytes, Value>,
    k: &str,
) -> Result<&'a Value, Error> {
    dict.get(k.as_bytes())
        .ok_or_else(|| Error::Protocol(format!("missing key '{k}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_error_message() {
        let msg = Message::error(Bytes::from_static(b"aa"), ERROR_GENERIC, "An Error");
        assert_eq!(msg.encode(), b"d1:eli201e8:An Errore1:t2:aa1:y1:ee");
    }

    #[test]
    fn roundtrips_query() {
        let mut args = BTreeMap::new();
        args.insert(key("id"), Value::bytes(&b"abcdefghij0123456789"[..]));
        let msg = Message::Query {
            tid: Bytes::from_static(b"aa"),
            method: Bytes::from_static(b"ping"),
            args,
        };
        let encoded = msg.encode();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_rejects_missing_fields() {
        let (value, _) = Value::decode(b"d1:t2:aae").unwrap();
        assert!(Message::from_value(&value).is_err());
    }

    #[test]
    fn decode_rejects_bad_discriminant() {
        let (value, _) = Value::decode(b"d1:t2:aa1:y1:xe").unwrap();
        let err = Message::from_value(&value).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn decode_rejects_error_list_of_wrong_length() {
        let (value, _) = Value::decode(b"d1:eli201ee1:t2:aa1:y1:ee").unwrap();
        assert!(Message::from_value(&value).is_err());
    }
}
