use actix_http::h1;
use actix_web::dev::ServiceRequest;
use actix_web::http::Method;
use actix_web::web;
use bytes::Bytes;
use serde_json::{Map, Value, json};
use time::OffsetDateTime;

/// `requestMethod` code stored in the log table.
///
/// Methods outside the fixed enumeration (extension methods) code to 0.
pub fn method_code(method: &Method) -> i16 {
    match method.as_str() {
        "GET" => 1,
        "POST" => 2,
        "PUT" => 3,
        "PATCH" => 4,
        "DELETE" => 5,
        "HEAD" => 6,
        "CONNECT" => 7,
        "OPTIONS" => 8,
        "TRACE" => 9,
        _ => 0,
    }
}

/// Request-phase fields of a log row, captured once at entry and reused for
/// whichever write(s) the strategy performs.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    /// Time the request was received, not the time of the log write.
    pub time: OffsetDateTime,
    pub uri: String,
    pub method: i16,
    /// JSON text of `{"querystring": …, "body": …}`.
    pub params: String,
}

impl RequestRecord {
    /// Reads the payload to serialize `requestParams`, then replays the bytes
    /// into the request so downstream handlers still see the body.
    pub(crate) async fn capture(
        req: &mut ServiceRequest,
        time: OffsetDateTime,
    ) -> Result<Self, actix_web::Error> {
        let body = req.extract::<web::Bytes>().await?;
        let (_, mut payload) = h1::Payload::create(true);
        payload.unread_data(body.clone());
        req.set_payload(actix_http::Payload::from(payload));

        let params = json!({
            "querystring": parse_query(req.query_string()),
            "body": parse_body(&body),
        });

        Ok(RequestRecord {
            time,
            uri: req.path().to_string(),
            method: method_code(req.method()),
            params: params.to_string(),
        })
    }
}

/// Response-phase fields of a log row: outcome time, status (or error code),
/// and the body when capture is enabled.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub time: OffsetDateTime,
    pub status: u16,
    pub body: String,
}

impl ResponseRecord {
    pub(crate) fn from_error(err: &actix_web::Error) -> Self {
        ResponseRecord {
            time: OffsetDateTime::now_utc(),
            status: err.as_response_error().status_code().as_u16(),
            body: err.to_string(),
        }
    }
}

/// One persisted row, fixed columns only. Custom columns are configuration
/// specific and read separately when needed.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LogEntry {
    pub id: i64,
    #[sqlx(rename = "requestTime")]
    pub request_time: OffsetDateTime,
    #[sqlx(rename = "requestUri")]
    pub request_uri: String,
    #[sqlx(rename = "requestMethod")]
    pub request_method: i16,
    #[sqlx(rename = "requestParams")]
    pub request_params: String,
    #[sqlx(rename = "responseTime")]
    pub response_time: Option<OffsetDateTime>,
    #[sqlx(rename = "responseStatus")]
    pub response_status: Option<i64>,
    pub response: Option<String>,
}

fn parse_body(body: &Bytes) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Percent-decodes a query string into a JSON map; repeated keys collect into
/// arrays. An empty query string serializes as `""`.
fn parse_query(qs: &str) -> Value {
    if qs.is_empty() {
        return Value::String(String::new());
    }
    let mut map = Map::new();
    for pair in qs.split('&') {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = decode(name);
        let value = Value::String(decode(value));
        match map.get_mut(&name) {
            Some(Value::Array(seen)) => seen.push(value),
            Some(prev) => {
                let first = prev.take();
                *prev = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(name, value);
            }
        }
    }
    Value::Object(map)
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}
