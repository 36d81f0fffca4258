/*!
# Roll-call Viewer

A read-only web viewer for a building's public-safety check-in spreadsheet.

## Overview

Residents and volunteers report on a Google Form; responses land in a Google
Sheet. This service proxies that sheet for display: the published HTML of
every tab, and a derived "help needed" list of households that have not yet
reported themselves safe. Nothing is ever written back; submissions go
through the form.

## Architecture

### Upstream Layer
- **Sheets API source**: service-account authentication, tab list and raw
  cell values per tab
- **Published source**: the public `pubhtml` rendering, tab discovery from
  its inline script and root-relative URL rewriting

### Cache Layer
- One snapshot (tab list + payload per tab) per cache, refreshed whole after
  the TTL (5 minutes by default)
- Single-flight refresh: concurrent readers share one upstream refresh
- Failed refreshes keep serving the last good snapshot
- A tab that fails to load is cached empty without failing its siblings

### Projection Layer
- Keyword-based column discovery on the header row
- Rows reported safe ("平安") are dropped
- Newest first, by the parsed form timestamp

### Web Layer
- axum router with JSON and HTML endpoints, CSV/XLSX export

## Modules

- **date**: locale timestamp parsing
- **projector**: rows → help-needed records
- **cache**: generic single-flight snapshot cache
- **upstream**: Google Sheets adapters
- **config**: environment settings
- **error**: error taxonomy
- **downloader**: CSV / XLSX export
- **app**: routing and handlers

## REST API Endpoints

- `/api/sheet` - Published tabs; `?gid=` returns one tab's HTML
- `/api/sos` - Response tabs; `?id=` returns the help-needed list
- `/api/sos/export` - Help-needed list as CSV or XLSX
- `/api/health` - Cache status
*/

pub mod cache;
pub mod config;
pub mod date;
pub mod downloader;
pub mod error;
pub mod projector;
pub mod upstream;

#[cfg(feature = "web")]
pub mod app;

/// Re-export the types most callers need
pub use cache::{CacheConfig, RefreshCache, Snapshot, TabContent, TabDescriptor, TabListing, TabSource};
pub use config::Settings;
pub use error::{CacheError, ConfigError, UpstreamError};
pub use projector::{SosRecord, project_rows};
