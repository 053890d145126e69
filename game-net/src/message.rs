//! 业务消息编解码接口
//!
//! 网络层只定义信封格式，消息体的编解码交给实现了 [`NetMessage`] 的类型。
//! 默认使用 bincode，需要自定义格式的类型可以覆盖这两个方法。

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

/// 可在通道上收发的业务消息
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Move { x: f32, y: f32 }
///
/// impl NetMessage for Move {}
/// ```
pub trait NetMessage: Serialize + DeserializeOwned + Send + 'static {
    /// 编码为消息体字节
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// 从消息体字节解码
    fn parse_from(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    impl NetMessage for Position {}

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Upper(String);

    impl NetMessage for Upper {
        fn to_bytes(&self) -> Result<Vec<u8>> {
            Ok(self.0.to_uppercase().into_bytes())
        }

        fn parse_from(bytes: &[u8]) -> Result<Self> {
            Ok(Upper(String::from_utf8_lossy(bytes).into_owned()))
        }
    }

    #[test]
    fn test_default_codec_roundtrip() {
        let msg = Position { x: 1.5, y: -2.0 };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(Position::parse_from(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_default_codec_rejects_garbage() {
        assert!(Position::parse_from(&[1, 2]).is_err());
    }

    #[test]
    fn test_custom_codec_overrides_default() {
        let bytes = Upper("abc".to_string()).to_bytes().unwrap();
        assert_eq!(bytes, b"ABC");
        assert_eq!(Upper::parse_from(b"xyz").unwrap(), Upper("xyz".to_string()));
    }
}
