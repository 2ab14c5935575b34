//! API Tests
//!
//! - status: `/` and `/health`
//! - predict: `/predict` shapes, ordering and determinism
//! - errors: rejected bodies and engine failures

mod predict;
mod status;
