//! HTTP API of the governor
//!
//! Every endpoint answers with the [`api_types::ApiResponse`] envelope.
//!
//! # API Endpoints
//!
//! - `GET /api/v1/units` - allocatable units and their usage
//! - `GET /api/v1/devices` - per-device partition state
//! - `PUT /api/v1/devices/:node/:index/scheme` - declare the desired scheme
//! - `POST /api/v1/devices/:node/:index/clear-fault` - recover a failed device
//! - `GET /api/v1/profiles`, `PUT /api/v1/profiles` - list or replace profiles
//! - `POST /api/v1/profiles/validate` - validate one profile
//! - `DELETE /api/v1/profiles/:name` - remove a profile
//! - `PUT /api/v1/quotas` - replace the team quotas
//! - `POST /api/v1/workloads` - submit a workload request
//! - `GET /api/v1/workloads/:id` - admission state and queue position
//! - `DELETE /api/v1/workloads/:id` - cancel a request
//! - `POST /api/v1/workloads/:id/complete` - release a finished workload
//! - `GET /healthz`, `GET /readyz` - liveness and readiness

pub mod errors;
pub mod handlers;
pub mod server;

pub use errors::ApiError;
pub use server::ApiServer;
pub use server::Readiness;
