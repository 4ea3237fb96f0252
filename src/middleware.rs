use std::rc::Rc;

use actix_service::{Service, Transform, forward_ready};
use actix_utils::future::{Ready, ready};
use actix_web::body::{BoxBody, MessageBody, to_bytes};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::{Error, HttpMessage, HttpRequest, Result};
use futures_core::future::LocalBoxFuture;
use time::OffsetDateTime;

use crate::columns::ColumnSet;
use crate::error::ConfigError;
use crate::matcher::PathMatcher;
use crate::record::{RequestRecord, ResponseRecord};
use crate::store::LogStore;

/// Row id assigned by the before-phase write, exposed to downstream handlers
/// through the request's extensions.
///
/// Only present under the default two-phase strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessLogId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteStrategy {
    /// Insert a partial row up front, fill it in place once the outcome is
    /// known. The default.
    TwoPhase,
    /// Defer the single insert until after the downstream handler finishes.
    WriteOnce,
}

/// Middleware recording every non-exempt request and its outcome into a
/// log store.
///
/// # Examples
/// ```no_run
/// use actix_web::App;
/// use actix_web_middleware_accesslog::{AccessLog, Schema, SqliteLogStore};
///
/// # fn demo(pool: sqlx::SqlitePool) -> Result<(), Box<dyn std::error::Error>> {
/// let schema = Schema::new("accessLog", "accessLogID", ["userRole"])?;
/// let log = AccessLog::builder(SqliteLogStore::new(pool, schema))
///     .ignore("/health")
///     .extract(|req, _| req.headers().get("x-role").and_then(|v| v.to_str().ok()).map(String::from))
///     .finish()?;
///
/// let app = App::new().wrap(log);
/// # Ok(())
/// # }
/// ```
pub struct AccessLog(Rc<Inner>);

struct Inner {
    store: Rc<dyn LogStore>,
    columns: ColumnSet,
    matcher: PathMatcher,
    strategy: WriteStrategy,
    capture_response: bool,
}

impl AccessLog {
    /// Start configuring the middleware around a store.
    pub fn builder(store: impl LogStore + 'static) -> AccessLogBuilder {
        AccessLogBuilder {
            store: Rc::new(store),
            columns: ColumnSet::default(),
            matcher: PathMatcher::new(),
            regexes: Vec::new(),
            write_once: false,
            capture_response: false,
        }
    }
}

/// Builder for [`AccessLog`]. Finishing validates the configuration before
/// any request is served.
pub struct AccessLogBuilder {
    store: Rc<dyn LogStore>,
    columns: ColumnSet,
    matcher: PathMatcher,
    regexes: Vec<String>,
    write_once: bool,
    capture_response: bool,
}

impl AccessLogBuilder {
    /// Do not log requests for `path` or any of its sub-paths.
    pub fn ignore(mut self, path: impl AsRef<str>) -> Self {
        self.matcher.add_prefix(path.as_ref());
        self
    }

    /// Do not log requests whose path matches a regex.
    pub fn ignore_regex(mut self, pattern: impl Into<String>) -> Self {
        self.regexes.push(pattern.into());
        self
    }

    /// Wait until the response is known and write the row once, instead of
    /// the default insert-then-update pair.
    pub fn write_once(mut self, enabled: bool) -> Self {
        self.write_once = enabled;
        self
    }

    /// Record the full response body. Off by default; the stored body is then
    /// empty whatever the outcome.
    pub fn capture_response(mut self, enabled: bool) -> Self {
        self.capture_response = enabled;
        self
    }

    /// Register the extraction function for the next custom column, in the
    /// store's schema order.
    pub fn extract(
        mut self,
        f: impl Fn(&HttpRequest, Option<&ResponseRecord>) -> Option<String> + 'static,
    ) -> Self {
        self.columns.push(f);
        self
    }

    /// Validates the configuration against the store schema: the extractor
    /// count must equal the custom-column count, and every exemption regex
    /// must compile.
    pub fn finish(mut self) -> Result<AccessLog, ConfigError> {
        let names = self.store.custom_columns().len();
        if names != self.columns.len() {
            return Err(ConfigError::ColumnCountMismatch {
                names,
                extractors: self.columns.len(),
            });
        }
        for pattern in &self.regexes {
            self.matcher.add_regex(pattern)?;
        }
        Ok(AccessLog(Rc::new(Inner {
            store: self.store,
            columns: self.columns,
            matcher: self.matcher,
            strategy: if self.write_once {
                WriteStrategy::WriteOnce
            } else {
                WriteStrategy::TwoPhase
            },
            capture_response: self.capture_response,
        })))
    }
}

impl<S, B> Transform<S, ServiceRequest> for AccessLog
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = AccessLogMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AccessLogMiddleware {
            service: Rc::new(service),
            inner: Rc::clone(&self.0),
        }))
    }
}

/// Access log middleware service.
pub struct AccessLogMiddleware<S> {
    inner: Rc<Inner>,
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for AccessLogMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let inner = Rc::clone(&self.inner);
        let service = Rc::clone(&self.service);
        Box::pin(handle(inner, service, req))
    }
}

async fn handle<S, B>(
    inner: Rc<Inner>,
    service: Rc<S>,
    mut req: ServiceRequest,
) -> Result<ServiceResponse<BoxBody>, Error>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody + 'static,
{
    if inner.matcher.is_exempt(req.path()) {
        return Ok(service.call(req).await?.map_into_boxed_body());
    }

    let request_time = OffsetDateTime::now_utc();
    let record = RequestRecord::capture(&mut req, request_time).await?;
    // computed with no response yet; reused verbatim on the error path, where
    // the request is gone
    let entry_columns = inner.columns.extract(req.request(), None);

    match inner.strategy {
        WriteStrategy::TwoPhase => {
            let id = inner
                .store
                .insert_before(&record, &entry_columns)
                .await
                .map_err(Error::from)?;
            req.extensions_mut().insert(AccessLogId(id));

            match service.call(req).await {
                Ok(res) => {
                    let (res, outcome) = split_outcome(res, inner.capture_response).await?;
                    let columns = inner.columns.extract(res.request(), Some(&outcome));
                    inner
                        .store
                        .update_after(id, &outcome, &columns)
                        .await
                        .map_err(Error::from)?;
                    Ok(res)
                }
                Err(err) => {
                    let outcome = ResponseRecord::from_error(&err);
                    if let Err(store_err) =
                        inner.store.update_after(id, &outcome, &entry_columns).await
                    {
                        log::error!("access log update for failed request was lost: {store_err}");
                    }
                    Err(err)
                }
            }
        }
        WriteStrategy::WriteOnce => match service.call(req).await {
            Ok(res) => {
                let (res, outcome) = split_outcome(res, inner.capture_response).await?;
                let columns = inner.columns.extract(res.request(), Some(&outcome));
                inner
                    .store
                    .insert_complete(&record, &outcome, &columns)
                    .await
                    .map_err(Error::from)?;
                Ok(res)
            }
            Err(err) => {
                let outcome = ResponseRecord::from_error(&err);
                if let Err(store_err) = inner
                    .store
                    .insert_complete(&record, &outcome, &entry_columns)
                    .await
                {
                    log::error!("access log write for failed request was lost: {store_err}");
                }
                Err(err)
            }
        },
    }
}

/// Captures status (and body, when enabled) from the downstream response,
/// rebuilding the response around the captured bytes.
async fn split_outcome<B>(
    res: ServiceResponse<B>,
    capture: bool,
) -> Result<(ServiceResponse<BoxBody>, ResponseRecord), Error>
where
    B: MessageBody + 'static,
{
    let time = OffsetDateTime::now_utc();
    let status = res.status().as_u16();

    if !capture {
        let outcome = ResponseRecord {
            time,
            status,
            body: String::new(),
        };
        return Ok((res.map_into_boxed_body(), outcome));
    }

    let (req, res) = res.into_parts();
    let (res, body) = res.into_parts();
    let bytes = to_bytes(body).await.map_err(|err| {
        let err: Box<dyn std::error::Error> = err.into();
        actix_web::error::ErrorInternalServerError(err.to_string())
    })?;
    let outcome = ResponseRecord {
        time,
        status,
        body: String::from_utf8_lossy(&bytes).into_owned(),
    };
    let res = ServiceResponse::new(req, res.set_body(bytes)).map_into_boxed_body();
    Ok((res, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use actix_service::fn_service;
    use actix_web::HttpResponse;
    use actix_web::test::TestRequest;
    use async_trait::async_trait;
    use std::cell::RefCell;

    #[derive(Debug, Clone, Default)]
    struct MockRow {
        id: i64,
        uri: String,
        method: i16,
        params: String,
        before_custom: Option<Vec<Option<String>>>,
        outcome: Option<(u16, String)>,
        after_custom: Option<Vec<Option<String>>>,
    }

    #[derive(Default)]
    struct MockState {
        rows: Vec<MockRow>,
        fail_writes: bool,
    }

    struct MockStore {
        columns: Vec<String>,
        state: Rc<RefCell<MockState>>,
    }

    impl MockStore {
        fn new(columns: &[&str]) -> (Self, Rc<RefCell<MockState>>) {
            let state = Rc::new(RefCell::new(MockState::default()));
            let store = MockStore {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                state: Rc::clone(&state),
            };
            (store, state)
        }
    }

    #[async_trait(?Send)]
    impl LogStore for MockStore {
        fn custom_columns(&self) -> &[String] {
            &self.columns
        }

        async fn insert_before(
            &self,
            request: &RequestRecord,
            custom: &[Option<String>],
        ) -> Result<i64, StoreError> {
            let mut state = self.state.borrow_mut();
            if state.fail_writes {
                return Err(StoreError::new("store offline"));
            }
            let id = state.rows.len() as i64 + 1;
            state.rows.push(MockRow {
                id,
                uri: request.uri.clone(),
                method: request.method,
                params: request.params.clone(),
                before_custom: Some(custom.to_vec()),
                outcome: None,
                after_custom: None,
            });
            Ok(id)
        }

        async fn insert_complete(
            &self,
            request: &RequestRecord,
            response: &ResponseRecord,
            custom: &[Option<String>],
        ) -> Result<(), StoreError> {
            let mut state = self.state.borrow_mut();
            if state.fail_writes {
                return Err(StoreError::new("store offline"));
            }
            let id = state.rows.len() as i64 + 1;
            state.rows.push(MockRow {
                id,
                uri: request.uri.clone(),
                method: request.method,
                params: request.params.clone(),
                before_custom: None,
                outcome: Some((response.status, response.body.clone())),
                after_custom: Some(custom.to_vec()),
            });
            Ok(())
        }

        async fn update_after(
            &self,
            id: i64,
            response: &ResponseRecord,
            custom: &[Option<String>],
        ) -> Result<(), StoreError> {
            let mut state = self.state.borrow_mut();
            if state.fail_writes {
                return Err(StoreError::new("store offline"));
            }
            let row = state
                .rows
                .iter_mut()
                .find(|row| row.id == id)
                .ok_or_else(|| StoreError::new("no such row"))?;
            row.outcome = Some((response.status, response.body.clone()));
            row.after_custom = Some(custom.to_vec());
            Ok(())
        }
    }

    fn ok_service()
    -> impl Service<ServiceRequest, Response = ServiceResponse<BoxBody>, Error = Error> {
        fn_service(|req: ServiceRequest| async move {
            Ok(req.into_response(HttpResponse::Ok().body("hello")))
        })
    }

    fn failing_service()
    -> impl Service<ServiceRequest, Response = ServiceResponse<BoxBody>, Error = Error> {
        fn_service(|_req: ServiceRequest| async move {
            Err::<ServiceResponse<BoxBody>, Error>(actix_web::error::ErrorImATeapot("boom"))
        })
    }

    async fn middleware<S, B>(
        log: AccessLog,
        service: S,
    ) -> AccessLogMiddleware<S>
    where
        S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
        B: MessageBody + 'static,
    {
        log.new_transform(service).await.unwrap()
    }

    #[actix_web::test]
    async fn test_two_phase_success_logs_exactly_once() {
        let (store, state) = MockStore::new(&[]);
        let log = AccessLog::builder(store).finish().unwrap();
        let mw = middleware(log, ok_service()).await;

        let req = TestRequest::post().uri("/widgets?a=1").to_srv_request();
        let res = mw.call(req).await.unwrap();
        assert_eq!(res.status().as_u16(), 200);

        let state = state.borrow();
        assert_eq!(state.rows.len(), 1);
        let row = &state.rows[0];
        assert_eq!(row.uri, "/widgets");
        assert_eq!(row.method, 2);
        assert!(row.params.contains("querystring"));
        assert!(row.before_custom.is_some());
        assert_eq!(row.outcome, Some((200, String::new())));
    }

    #[actix_web::test]
    async fn test_two_phase_attaches_row_id_to_request() {
        let (store, state) = MockStore::new(&[]);
        let log = AccessLog::builder(store).finish().unwrap();
        let mw = middleware(
            log,
            fn_service(|req: ServiceRequest| async move {
                let id = req.extensions().get::<AccessLogId>().copied();
                let body = format!("{:?}", id.map(|AccessLogId(n)| n));
                Ok(req.into_response(HttpResponse::Ok().body(body)))
            }),
        )
        .await;

        let res = mw
            .call(TestRequest::get().uri("/x").to_srv_request())
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 200);

        let state = state.borrow();
        assert_eq!(state.rows[0].id, 1);
        // the handler saw the id of the before-phase row
        drop(state);
        let bytes = to_bytes(res.into_body()).await.unwrap();
        assert_eq!(&bytes[..], b"Some(1)");
    }

    #[actix_web::test]
    async fn test_write_once_waits_for_outcome() {
        let (store, state) = MockStore::new(&[]);
        let log = AccessLog::builder(store).write_once(true).finish().unwrap();
        let mw = middleware(
            log,
            fn_service(|req: ServiceRequest| async move {
                // single-phase: no row id exists while the handler runs
                assert!(req.extensions().get::<AccessLogId>().is_none());
                Ok(req.into_response(HttpResponse::Created().body("made")))
            }),
        )
        .await;

        let res = mw
            .call(TestRequest::post().uri("/orders").to_srv_request())
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 201);

        let state = state.borrow();
        assert_eq!(state.rows.len(), 1);
        let row = &state.rows[0];
        assert!(row.before_custom.is_none());
        assert_eq!(row.outcome, Some((201, String::new())));
    }

    #[actix_web::test]
    async fn test_downstream_error_is_logged_then_reraised() {
        for write_once in [false, true] {
            let (store, state) = MockStore::new(&[]);
            let log = AccessLog::builder(store)
                .write_once(write_once)
                .finish()
                .unwrap();
            let mw = middleware(log, failing_service()).await;

            let err = mw
                .call(TestRequest::get().uri("/explode").to_srv_request())
                .await
                .unwrap_err();
            assert_eq!(err.as_response_error().status_code().as_u16(), 418);
            assert_eq!(err.to_string(), "boom");

            let state = state.borrow();
            assert_eq!(state.rows.len(), 1);
            assert_eq!(state.rows[0].outcome, Some((418, "boom".to_string())));
        }
    }

    #[actix_web::test]
    async fn test_capture_response_stores_body() {
        let (store, state) = MockStore::new(&[]);
        let log = AccessLog::builder(store)
            .capture_response(true)
            .finish()
            .unwrap();
        let mw = middleware(log, ok_service()).await;

        let res = mw
            .call(TestRequest::get().uri("/x").to_srv_request())
            .await
            .unwrap();

        assert_eq!(
            state.borrow().rows[0].outcome,
            Some((200, "hello".to_string()))
        );

        // the client still receives the body
        let bytes = to_bytes(res.into_body()).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[actix_web::test]
    async fn test_capture_disabled_stores_empty_body() {
        let (store, state) = MockStore::new(&[]);
        let log = AccessLog::builder(store).finish().unwrap();
        let mw = middleware(log, ok_service()).await;

        mw.call(TestRequest::get().uri("/x").to_srv_request())
            .await
            .unwrap();
        assert_eq!(state.borrow().rows[0].outcome, Some((200, String::new())));
    }

    #[actix_web::test]
    async fn test_exempt_path_bypasses_logging() {
        let (store, state) = MockStore::new(&[]);
        let log = AccessLog::builder(store)
            .ignore("/health")
            .ignore("/metrics")
            .finish()
            .unwrap();
        let mw = middleware(log, ok_service()).await;

        for uri in ["/health", "/health/live", "/metrics/prometheus"] {
            let res = mw
                .call(TestRequest::get().uri(uri).to_srv_request())
                .await
                .unwrap();
            assert_eq!(res.status().as_u16(), 200);
        }
        assert!(state.borrow().rows.is_empty());

        let res = mw
            .call(TestRequest::get().uri("/healthy").to_srv_request())
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 200);
        assert_eq!(state.borrow().rows.len(), 1);
    }

    #[actix_web::test]
    async fn test_custom_columns_recomputed_with_response() {
        let (store, state) = MockStore::new(&["userRole", "status"]);
        let log = AccessLog::builder(store)
            .extract(|req, _| {
                req.headers()
                    .get("x-role")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            })
            .extract(|_, res| res.map(|r| r.status.to_string()))
            .finish()
            .unwrap();
        let mw = middleware(log, ok_service()).await;

        mw.call(
            TestRequest::get()
                .uri("/x")
                .insert_header(("x-role", "admin"))
                .to_srv_request(),
        )
        .await
        .unwrap();

        let state = state.borrow();
        let row = &state.rows[0];
        assert_eq!(
            row.before_custom,
            Some(vec![Some("admin".to_string()), None])
        );
        assert_eq!(
            row.after_custom,
            Some(vec![Some("admin".to_string()), Some("200".to_string())])
        );
    }

    #[test]
    fn test_column_count_mismatch_fails_before_any_write() {
        let (store, state) = MockStore::new(&["userRole", "tenant"]);
        let result = AccessLog::builder(store)
            .extract(|_, _| Some("only-one".to_string()))
            .finish();

        assert!(matches!(
            result,
            Err(ConfigError::ColumnCountMismatch {
                names: 2,
                extractors: 1
            })
        ));
        assert!(state.borrow().rows.is_empty());
    }

    #[actix_web::test]
    async fn test_store_failure_surfaces_on_success_path() {
        let (store, state) = MockStore::new(&[]);
        state.borrow_mut().fail_writes = true;
        let log = AccessLog::builder(store).finish().unwrap();
        let mw = middleware(log, ok_service()).await;

        let err = mw
            .call(TestRequest::get().uri("/x").to_srv_request())
            .await
            .unwrap_err();
        assert_eq!(err.as_response_error().status_code().as_u16(), 500);
        assert!(err.to_string().contains("access log write failed"));
    }

    #[actix_web::test]
    async fn test_store_failure_never_masks_downstream_error() {
        let (store, state) = MockStore::new(&[]);
        let log = AccessLog::builder(store).write_once(true).finish().unwrap();
        let mw = middleware(log, failing_service()).await;

        state.borrow_mut().fail_writes = true;
        let err = mw
            .call(TestRequest::get().uri("/x").to_srv_request())
            .await
            .unwrap_err();
        // the original error wins even though the log write was lost
        assert_eq!(err.to_string(), "boom");
        assert!(state.borrow().rows.is_empty());
    }
}
