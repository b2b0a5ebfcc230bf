//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了JSON序列化器的实现。

use super::Serializer;
use crate::error::{CacheError, Result};
use serde::{de::DeserializeOwned, Serialize};

/// JSON序列化器
///
/// 实现基于serde_json的序列化和反序列化。启用压缩时，
/// JSON 先经 gzip 压缩再做 base64 编码，以便存入字符串值。
#[derive(Clone, Debug)]
pub struct JsonSerializer {
    /// 是否启用压缩
    compress: bool,
}

impl JsonSerializer {
    /// 创建新的JSON序列化器
    pub fn new() -> Self {
        Self { compress: false }
    }

    /// 创建启用压缩的JSON序列化器
    pub fn with_compression() -> Self {
        Self { compress: true }
    }
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "compression")]
fn compress(json: String) -> Result<String> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(json.as_bytes())
        .map_err(|e| CacheError::Serialization(e.to_string()))?;
    let bytes = encoder
        .finish()
        .map_err(|e| CacheError::Serialization(e.to_string()))?;
    Ok(STANDARD.encode(bytes))
}

#[cfg(not(feature = "compression"))]
fn compress(json: String) -> Result<String> {
    // 未启用压缩特性时按原样存储
    Ok(json)
}

#[cfg(feature = "compression")]
fn decompress(data: &str) -> Result<String> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use flate2::read::GzDecoder;
    use std::io::Read;

    let bytes = STANDARD
        .decode(data)
        .map_err(|e| CacheError::Serialization(e.to_string()))?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut decoded = String::new();
    decoder
        .read_to_string(&mut decoded)
        .map_err(|e| CacheError::Serialization(e.to_string()))?;
    Ok(decoded)
}

#[cfg(not(feature = "compression"))]
fn decompress(data: &str) -> Result<String> {
    Ok(data.to_string())
}

impl Serializer for JsonSerializer {
    /// 序列化值为JSON文本
    ///
    /// # 参数
    ///
    /// * `value` - 要序列化的值
    ///
    /// # 返回值
    ///
    /// 返回序列化后的文本或错误
    fn serialize<T: Serialize>(&self, value: &T) -> Result<String> {
        let json =
            serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        if self.compress {
            compress(json)
        } else {
            Ok(json)
        }
    }

    /// 从JSON文本反序列化值
    fn deserialize<T: DeserializeOwned>(&self, data: &str) -> Result<T> {
        if self.compress {
            let json = decompress(data)?;
            serde_json::from_str(&json).map_err(|e| CacheError::Serialization(e.to_string()))
        } else {
            serde_json::from_str(data).map_err(|e| CacheError::Serialization(e.to_string()))
        }
    }
}
