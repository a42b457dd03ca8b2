//! Deep-link URL construction and callback parsing.
//!
//! Requests are serialized into query parameters on the wallet's scheme:
//! `{callback_url, request_id, network, app_name}` plus a base64-encoded
//! JSON `transaction` or `message_payload`. The wallet returns through the
//! callback URL with `request_id` and either `result` (base64 JSON) or
//! `error`.

use base64::{Engine as _, prelude::BASE64_STANDARD};
use url::Url;

use crate::domain::{
    DeepLinkConfig, ErrorKind, Nep413Payload, Network, TransactionParams, WalletError,
};

/// Common parameters carried by every outbound deep link.
#[derive(Debug, Clone)]
pub struct DeepLinkContext<'a> {
    pub callback_url: &'a str,
    pub request_id: &'a str,
    pub network: Network,
    pub app_name: &'a str,
}

fn base_url(config: &DeepLinkConfig, path: &str) -> Result<Url, WalletError> {
    Url::parse(&format!("{}://{}", config.scheme, path)).map_err(|e| {
        WalletError::new(
            ErrorKind::InvalidManifest,
            format!("bad deep-link scheme {:?}: {e}", config.scheme),
        )
    })
}

fn apply_context(url: &mut Url, ctx: &DeepLinkContext<'_>) {
    url.query_pairs_mut()
        .append_pair("callback_url", ctx.callback_url)
        .append_pair("request_id", ctx.request_id)
        .append_pair("network", ctx.network.as_str())
        .append_pair("app_name", ctx.app_name);
}

/// Connect request URL.
pub fn build_connect_url(
    config: &DeepLinkConfig,
    ctx: &DeepLinkContext<'_>,
) -> Result<Url, WalletError> {
    let mut url = base_url(config, &config.paths.connect)?;
    apply_context(&mut url, ctx);
    Ok(url)
}

/// Sign-transaction request URL; the transaction rides as base64 JSON.
pub fn build_sign_url(
    config: &DeepLinkConfig,
    ctx: &DeepLinkContext<'_>,
    transaction: &TransactionParams,
) -> Result<Url, WalletError> {
    let json = serde_json::to_vec(transaction).map_err(|e| {
        WalletError::new(ErrorKind::InvalidTransaction, format!("transaction encode: {e}"))
    })?;
    let mut url = base_url(config, &config.paths.sign_transaction)?;
    apply_context(&mut url, ctx);
    url.query_pairs_mut()
        .append_pair("transaction", &BASE64_STANDARD.encode(json));
    Ok(url)
}

/// Sign-message request URL; the NEP-413 payload rides as base64 JSON.
pub fn build_sign_message_url(
    config: &DeepLinkConfig,
    ctx: &DeepLinkContext<'_>,
    payload: &Nep413Payload,
) -> Result<Url, WalletError> {
    let json = serde_json::to_vec(payload).map_err(|e| {
        WalletError::new(ErrorKind::InvalidData, format!("message payload encode: {e}"))
    })?;
    let mut url = base_url(config, &config.paths.sign_message)?;
    apply_context(&mut url, ctx);
    url.query_pairs_mut()
        .append_pair("message_payload", &BASE64_STANDARD.encode(json));
    Ok(url)
}

/// Parameters extracted from a wallet callback URL.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackParams {
    pub request_id: String,
    /// Decoded JSON result, when the wallet succeeded.
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// CSRF `state` token, when present.
    pub state: Option<String>,
}

/// Parse a callback URL. `Ok(None)` when the URL carries no `request_id`
/// (not a wallet callback).
pub fn parse_callback_url(url: &str) -> Result<Option<CallbackParams>, WalletError> {
    let parsed = Url::parse(url).map_err(|e| {
        WalletError::new(ErrorKind::InvalidData, format!("bad callback url: {e}"))
    })?;

    let mut request_id = None;
    let mut result_raw = None;
    let mut error = None;
    let mut state = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "request_id" => request_id = Some(value.into_owned()),
            "result" => result_raw = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }

    let Some(request_id) = request_id else {
        return Ok(None);
    };

    let result = result_raw
        .map(|encoded| {
            let bytes = BASE64_STANDARD.decode(encoded.as_bytes()).map_err(|e| {
                WalletError::new(ErrorKind::InvalidData, format!("callback result decode: {e}"))
            })?;
            serde_json::from_slice(&bytes).map_err(|e| {
                WalletError::new(ErrorKind::InvalidData, format!("callback result parse: {e}"))
            })
        })
        .transpose()?;

    Ok(Some(CallbackParams {
        request_id,
        result,
        error,
        state,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Action;

    fn config() -> DeepLinkConfig {
        serde_json::from_value(serde_json::json!({
            "scheme": "demowallet",
            "appStoreUrl": "https://apps.example/demo"
        }))
        .unwrap()
    }

    fn ctx<'a>(request_id: &'a str) -> DeepLinkContext<'a> {
        DeepLinkContext {
            callback_url: "https://app.example/return",
            request_id,
            network: Network::Testnet,
            app_name: "Demo App",
        }
    }

    #[test]
    fn test_connect_url_contract() {
        let url = build_connect_url(&config(), &ctx("r-1")).unwrap();
        assert_eq!(url.scheme(), "demowallet");
        let query: std::collections::HashMap<_, _> = url.query_pairs().collect();
        assert_eq!(query["callback_url"], "https://app.example/return");
        assert_eq!(query["request_id"], "r-1");
        assert_eq!(query["network"], "testnet");
        assert_eq!(query["app_name"], "Demo App");
    }

    #[test]
    fn test_sign_url_embeds_base64_transaction() {
        let tx = TransactionParams::new("bob.near", vec![Action::Transfer { deposit: 5 }]);
        let url = build_sign_url(&config(), &ctx("r-2"), &tx).unwrap();
        let query: std::collections::HashMap<_, _> = url.query_pairs().collect();

        let decoded = BASE64_STANDARD.decode(query["transaction"].as_bytes()).unwrap();
        let back: TransactionParams = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_sign_message_url_embeds_payload() {
        let payload = Nep413Payload::new("hello", "app.near", [3u8; 32]);
        let url = build_sign_message_url(&config(), &ctx("r-3"), &payload).unwrap();
        let query: std::collections::HashMap<_, _> = url.query_pairs().collect();

        let decoded = BASE64_STANDARD
            .decode(query["message_payload"].as_bytes())
            .unwrap();
        let back: Nep413Payload = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_parse_callback_with_result() {
        let result = BASE64_STANDARD.encode(serde_json::json!({"accounts": []}).to_string());
        let url = format!(
            "https://app.example/return?request_id=r-1&result={result}&state=abc"
        );
        let params = parse_callback_url(&url).unwrap().unwrap();
        assert_eq!(params.request_id, "r-1");
        assert_eq!(params.result, Some(serde_json::json!({"accounts": []})));
        assert_eq!(params.state.as_deref(), Some("abc"));
        assert!(params.error.is_none());
    }

    #[test]
    fn test_parse_callback_with_error() {
        let url = "https://app.example/return?request_id=r-1&error=user%20rejected";
        let params = parse_callback_url(url).unwrap().unwrap();
        assert_eq!(params.error.as_deref(), Some("user rejected"));
        assert!(params.result.is_none());
    }

    #[test]
    fn test_non_callback_url_is_none() {
        assert!(parse_callback_url("https://app.example/?foo=1").unwrap().is_none());
    }

    #[test]
    fn test_malformed_result_is_invalid_data() {
        let url = "https://app.example/return?request_id=r-1&result=%3F%3F";
        let err = parse_callback_url(url).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidData);
    }
}
