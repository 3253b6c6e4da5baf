//! VNPay request signing and callback verification.
//!
//! Parameters are sorted by key, form-url-encoded and signed with
//! HMAC-SHA512 over the merchant hash secret. The gateway echoes the same
//! scheme back on the browser return and on the IPN.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use std::collections::BTreeMap;

use crate::config::VnPayConfig;

type HmacSha512 = Hmac<Sha512>;

pub const SECURE_HASH: &str = "vnp_SecureHash";
pub const SECURE_HASH_TYPE: &str = "vnp_SecureHashType";
pub const SUCCESS_CODE: &str = "00";

/// Query parameters as received, keyed and ordered by name.
pub type VnPayParams = BTreeMap<String, String>;

const GMT7_SECONDS: i32 = 7 * 3600;
const DATE_FORMAT: &str = "%Y%m%d%H%M%S";

/// Hex HMAC-SHA512 of `data`.
pub fn sign(secret: &str, data: &str) -> String {
    let mut mac = match HmacSha512::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length
        Err(_) => return String::new(),
    };
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Canonical signing input: every non-empty `vnp_` parameter except the hash fields.
fn signing_data(params: &VnPayParams) -> String {
    let signed: Vec<(&str, &str)> = params
        .iter()
        .filter(|(k, v)| {
            k.starts_with("vnp_") && !v.is_empty() && k.as_str() != SECURE_HASH && k.as_str() != SECURE_HASH_TYPE
        })
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    serde_urlencoded::to_string(signed).unwrap_or_default()
}

/// Checks `vnp_SecureHash` against the rest of the query. Case-insensitive
/// and compared in constant time.
pub fn validate_signature(query: Option<&VnPayParams>, secret: &str) -> bool {
    let Some(query) = query else {
        return false;
    };
    if query.is_empty() {
        return false;
    }
    let Some(received) = query.get(SECURE_HASH).filter(|h| !h.is_empty()) else {
        return false;
    };
    let Ok(received) = hex::decode(received.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(signing_data(query).as_bytes());
    mac.verify_slice(&received).is_ok()
}

/// Signs `params` in place, the way the gateway signs its callbacks.
pub fn append_signature(params: &mut VnPayParams, secret: &str) {
    params.remove(SECURE_HASH);
    let hash = sign(secret, &signing_data(params));
    params.insert(SECURE_HASH.to_string(), hash);
}

pub fn format_gmt7(at: DateTime<Utc>) -> String {
    match FixedOffset::east_opt(GMT7_SECONDS) {
        Some(offset) => at.with_timezone(&offset).format(DATE_FORMAT).to_string(),
        None => at.format(DATE_FORMAT).to_string(),
    }
}

/// Gateway result carried by a return or IPN query.
#[derive(Debug, Clone, PartialEq)]
pub struct VnPayResponse {
    pub txn_ref: String,
    /// Amount in VND; the gateway sends it multiplied by 100.
    pub amount: i64,
    pub response_code: String,
    pub transaction_status: Option<String>,
    pub transaction_no: Option<String>,
    pub bank_code: Option<String>,
}

impl VnPayResponse {
    /// `None` when a required field is missing or the amount is not a whole
    /// number of VND.
    pub fn from_params(params: &VnPayParams) -> Option<Self> {
        let txn_ref = params.get("vnp_TxnRef").filter(|v| !v.is_empty())?.clone();
        let raw_amount = params.get("vnp_Amount")?.parse::<i64>().ok()?;
        if raw_amount % 100 != 0 {
            return None;
        }
        let amount = raw_amount / 100;
        let response_code = params.get("vnp_ResponseCode")?.clone();
        Some(Self {
            txn_ref,
            amount,
            response_code,
            transaction_status: params.get("vnp_TransactionStatus").cloned(),
            transaction_no: params.get("vnp_TransactionNo").cloned(),
            bank_code: params.get("vnp_BankCode").cloned(),
        })
    }

    /// Both the response code and, when present, the transaction status must be "00".
    pub fn is_success(&self) -> bool {
        self.response_code == SUCCESS_CODE
            && self
                .transaction_status
                .as_deref()
                .map_or(true, |status| status == SUCCESS_CODE)
    }
}

#[derive(Debug, Clone)]
pub struct VnPay {
    config: VnPayConfig,
}

impl VnPay {
    pub fn new(config: VnPayConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, query: Option<&VnPayParams>) -> bool {
        validate_signature(query, &self.config.hash_secret)
    }

    /// Builds the signed redirect URL for an order of `amount` VND.
    pub fn create_payment_url(
        &self,
        amount: i64,
        order_info: &str,
        order_id: &str,
        client_ip: &str,
        now: DateTime<Utc>,
    ) -> String {
        let mut params = VnPayParams::new();
        let mut put = |k: &str, v: String| {
            params.insert(k.to_string(), v);
        };
        put("vnp_Version", self.config.version.clone());
        put("vnp_Command", "pay".to_string());
        put("vnp_TmnCode", self.config.tmn_code.clone());
        put("vnp_Amount", (amount * 100).to_string());
        put("vnp_CurrCode", "VND".to_string());
        put("vnp_TxnRef", order_id.to_string());
        put("vnp_OrderInfo", order_info.to_string());
        put("vnp_OrderType", "other".to_string());
        put("vnp_Locale", self.config.locale.clone());
        put("vnp_ReturnUrl", self.config.return_url.clone());
        put("vnp_IpAddr", client_ip.to_string());
        put("vnp_CreateDate", format_gmt7(now));
        put(
            "vnp_ExpireDate",
            format_gmt7(now + Duration::minutes(self.config.expire_minutes)),
        );

        let query = signing_data(&params);
        let hash = sign(&self.config.hash_secret, &query);
        format!("{}?{}&{}={}", self.config.payment_url, query, SECURE_HASH, hash)
    }
}
