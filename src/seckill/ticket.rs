//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了订单消息及其在队列中的字段编码。

use crate::backend::StreamRecord;
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const FIELD_ORDER_ID: &str = "orderId";
pub const FIELD_USER_ID: &str = "userId";
pub const FIELD_ITEM_ID: &str = "itemId";
pub const FIELD_ISSUED_AT: &str = "issuedAt";

/// 订单消息
///
/// 准入成功时生成一次，落库时按 (user_id, item_id) 去重，至多生效一次。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTicket {
    pub order_id: i64,
    pub user_id: i64,
    pub item_id: i64,
    pub issued_at: DateTime<Utc>,
}

impl OrderTicket {
    /// 编码为队列字段
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (FIELD_ORDER_ID, self.order_id.to_string()),
            (FIELD_USER_ID, self.user_id.to_string()),
            (FIELD_ITEM_ID, self.item_id.to_string()),
            (FIELD_ISSUED_AT, self.issued_at.to_rfc3339()),
        ]
    }

    /// 从队列消息解析
    pub fn from_record(record: &StreamRecord) -> Result<Self> {
        let malformed = |reason: String| CacheError::MalformedTicket {
            id: record.id.clone(),
            reason,
        };
        let id_field = |name: &str| -> Result<i64> {
            let raw = record
                .fields
                .get(name)
                .ok_or_else(|| malformed(format!("missing field {}", name)))?;
            raw.parse::<i64>()
                .map_err(|e| malformed(format!("invalid {} {:?}: {}", name, raw, e)))
        };

        let issued_at = record
            .fields
            .get(FIELD_ISSUED_AT)
            .ok_or_else(|| malformed(format!("missing field {}", FIELD_ISSUED_AT)))?;
        let issued_at = DateTime::parse_from_rfc3339(issued_at)
            .map_err(|e| malformed(format!("invalid {}: {}", FIELD_ISSUED_AT, e)))?
            .with_timezone(&Utc);

        Ok(Self {
            order_id: id_field(FIELD_ORDER_ID)?,
            user_id: id_field(FIELD_USER_ID)?,
            item_id: id_field(FIELD_ITEM_ID)?,
            issued_at,
        })
    }
}
