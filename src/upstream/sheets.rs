//! Sheets API source: tab list and raw cell values, authenticated with a
//! Google service account.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{http_client, send};
use crate::cache::{TabDescriptor, TabSource};
use crate::error::UpstreamError;

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const READONLY_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets.readonly";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens are renewed this long before Google says they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Raw cell values of one tab, header row first.
pub type RowMatrix = Vec<Vec<String>>;

/// Service account credentials.
#[derive(Clone)]
pub struct ServiceAccount {
    pub client_email: String,
    /// PEM-encoded RSA private key.
    pub private_key: String,
}

impl std::fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Reads a spreadsheet through the Sheets API.
pub struct SheetsSource {
    client: reqwest::Client,
    spreadsheet_id: String,
    account: ServiceAccount,
    token: Mutex<Option<CachedToken>>,
}

impl SheetsSource {
    pub fn new(spreadsheet_id: impl Into<String>, account: ServiceAccount) -> Result<Self, UpstreamError> {
        Ok(Self {
            client: http_client()?,
            spreadsheet_id: spreadsheet_id.into(),
            account,
            token: Mutex::new(None),
        })
    }

    /// Signed assertion exchanged for an access token.
    fn sign_assertion(&self) -> Result<String, UpstreamError> {
        let key = EncodingKey::from_rsa_pem(self.account.private_key.as_bytes())
            .map_err(|e| UpstreamError::Auth(format!("invalid private key: {}", e)))?;
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.account.client_email,
            scope: READONLY_SCOPE,
            aud: TOKEN_URL,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| UpstreamError::Auth(format!("failed to sign assertion: {}", e)))
    }

    /// Current access token, fetching a new one when missing or about to expire.
    async fn access_token(&self) -> Result<String, UpstreamError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let assertion = self.sign_assertion()?;
        let request = self
            .client
            .post(TOKEN_URL)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())]);
        let response: TokenResponse = send(request, TOKEN_URL)
            .await
            .map_err(|e| UpstreamError::Auth(e.to_string()))?
            .json()
            .await
            .map_err(|e| UpstreamError::Auth(format!("unreadable token response: {}", e)))?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        log::debug!("obtained access token valid for {}s", lifetime.as_secs());
        *cached = Some(CachedToken {
            value: response.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(response.access_token)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, UpstreamError> {
        let token = self.access_token().await?;
        send(self.client.get(url).bearer_auth(token), url)
            .await?
            .json()
            .await
            .map_err(|e| UpstreamError::Parse(format!("{}: {}", url, e)))
    }
}

/// A1 range covering a whole tab, e.g. `'Form responses 1'`.
pub fn whole_tab_range(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

fn cell_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl TabSource for SheetsSource {
    type Id = i64;
    type Payload = RowMatrix;

    async fn list_tabs(&self) -> Result<Vec<TabDescriptor<i64>>, UpstreamError> {
        let url = format!(
            "{}/{}?fields=sheets.properties(sheetId,title)",
            SHEETS_API_BASE,
            urlencoding::encode(&self.spreadsheet_id)
        );
        let meta: SpreadsheetMeta = self.get_json(&url).await?;
        Ok(meta
            .sheets
            .into_iter()
            .map(|sheet| TabDescriptor::new(sheet.properties.title, sheet.properties.sheet_id))
            .collect())
    }

    async fn fetch_tab(&self, tab: &TabDescriptor<i64>) -> Result<RowMatrix, UpstreamError> {
        let url = format!(
            "{}/{}/values/{}?valueRenderOption=FORMATTED_VALUE&majorDimension=ROWS",
            SHEETS_API_BASE,
            urlencoding::encode(&self.spreadsheet_id),
            urlencoding::encode(&whole_tab_range(&tab.name))
        );
        let range: ValueRange = self.get_json(&url).await?;
        Ok(range
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_text).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_quotes_tab_titles() {
        assert_eq!(whole_tab_range("表單回應 1"), "'表單回應 1'");
        assert_eq!(whole_tab_range("Bob's sheet"), "'Bob''s sheet'");
    }

    #[test]
    fn cells_are_rendered_as_text() {
        assert_eq!(cell_text(serde_json::json!("求救")), "求救");
        assert_eq!(cell_text(serde_json::json!(42)), "42");
        assert_eq!(cell_text(serde_json::Value::Null), "");
    }

    #[test]
    fn value_ranges_without_values_are_empty() {
        let range: ValueRange = serde_json::from_str(r#"{"range":"'Empty'!A1:Z1000"}"#).unwrap();
        assert!(range.values.is_empty());
    }

    #[test]
    fn spreadsheet_metadata_lists_tabs() {
        let meta: SpreadsheetMeta = serde_json::from_str(
            r#"{"sheets":[{"properties":{"sheetId":0,"title":"表單回應 1"}},{"properties":{"sheetId":1234,"title":"統計"}}]}"#,
        )
        .unwrap();
        let ids: Vec<i64> = meta.sheets.iter().map(|s| s.properties.sheet_id).collect();
        assert_eq!(ids, vec![0, 1234]);
        assert_eq!(meta.sheets[1].properties.title, "統計");
    }

    #[test]
    fn bad_private_key_is_an_auth_error() {
        let source = SheetsSource::new(
            "sheet",
            ServiceAccount {
                client_email: "svc@example.iam.gserviceaccount.com".into(),
                private_key: "not a key".into(),
            },
        )
        .unwrap();
        assert!(matches!(source.sign_assertion(), Err(UpstreamError::Auth(_))));
    }
}
