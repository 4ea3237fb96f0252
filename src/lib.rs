//! Actix-web middleware that records every request and its outcome into a
//! database-backed access log.
//!
//! Each non-exempt request produces exactly one row: request time, path,
//! method code, serialized parameters, and (once the handler finishes) the
//! response time, status, and optionally the body. Caller-defined custom
//! columns can be appended to every row.
//!
//! # Examples
//! ```no_run
//! use actix_web::{App, HttpServer, web};
//! use actix_web_middleware_accesslog::{AccessLog, Schema, SqliteLogStore};
//! use sqlx::sqlite::SqlitePoolOptions;
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let pool = SqlitePoolOptions::new()
//!         .connect("sqlite://access.db")
//!         .await
//!         .expect("database");
//!
//!     let schema = Schema::new("accessLog", "accessLogID", ["userRole"]).expect("schema");
//!
//!     HttpServer::new(move || {
//!         let log = AccessLog::builder(SqliteLogStore::new(pool.clone(), schema.clone()))
//!             .ignore("/health")
//!             .extract(|req, _| {
//!                 req.headers()
//!                     .get("x-role")
//!                     .and_then(|v| v.to_str().ok())
//!                     .map(String::from)
//!             })
//!             .finish()
//!             .expect("access log configuration");
//!
//!         App::new()
//!             .wrap(log)
//!             .route("/", web::get().to(|| async { "Hello world!" }))
//!     })
//!     .bind("127.0.0.1:8080")?
//!     .run()
//!     .await
//! }
//! ```
//!
//! # Write strategies
//!
//! By default a partial row is inserted before the handler runs and updated
//! in place once the outcome is known; the row id is available to handlers
//! through the request extensions as [`AccessLogId`]. With
//! [`write_once`](AccessLogBuilder::write_once) the single insert is deferred
//! until after the handler finishes.
//!
//! Handler errors are logged (their status code and message take the place of
//! the response fields) and then returned unchanged, so upstream error
//! handling never notices the logging layer.
//!
//! # Path exclusions
//!
//! Exclude a path and all of its sub-paths from logging:
//!
//! ```rust
//! # use actix_web_middleware_accesslog::PathMatcher;
//! let mut matcher = PathMatcher::new();
//! matcher.add_prefix("/authorize");
//! assert!(matcher.is_exempt("/authorize/login"));
//! assert!(!matcher.is_exempt("/auth"));
//! ```
//!
//! or use regex patterns via
//! [`ignore_regex`](AccessLogBuilder::ignore_regex). Matching errs toward
//! logging: a path that fails to match cleanly is recorded, not skipped.
//!
//! # Custom columns
//!
//! The store schema fixes the custom column names at construction; one
//! extraction function is registered per column, in schema order. The counts
//! must agree or [`finish`](AccessLogBuilder::finish) fails before anything
//! is written. Extractors run once when the request arrives (no response
//! yet) and again with the captured response before the after-write.

mod columns;
mod error;
mod matcher;
mod middleware;
mod record;
mod store;

pub use crate::columns::{ColumnSet, Extractor};
pub use crate::error::{ConfigError, StoreError};
pub use crate::matcher::PathMatcher;
pub use crate::middleware::{AccessLog, AccessLogBuilder, AccessLogId, AccessLogMiddleware};
pub use crate::record::{LogEntry, RequestRecord, ResponseRecord, method_code};
pub use crate::store::{LogStore, Schema, SqliteLogStore};
