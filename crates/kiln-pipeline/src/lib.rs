//! kiln-pipeline — the deployment pipeline.
//!
//! A run takes a `(user_id, code)` submission through a fixed sequence:
//!
//! 1. Ensure the user's namespace and test environment exist.
//! 2. Wait for the environment to become ready ([`ReadinessPoller`]).
//! 3. Inject the code, wait a settle interval, fetch the logs.
//! 4. Decide pass/fail from the logs ([`VerdictEvaluator`]).
//! 5. On pass, replace the production pair ([`PromotionExecutor`]).
//!
//! Runs for the same user are serialized by [`UserLocks`]; every
//! suspension point races a [`CancellationToken`](tokio_util::sync::CancellationToken).

pub mod cancel;
pub mod controller;
pub mod error;
pub mod locks;
pub mod promotion;
pub mod readiness;
pub mod settings;
pub mod verdict;

pub use controller::Pipeline;
pub use error::{PipelineError, PipelineResult, PromotionError};
pub use locks::{UserGuard, UserLocks};
pub use promotion::{PromotionExecutor, PromotionReport};
pub use readiness::{ReadinessPoller, ReadinessState};
pub use settings::PipelineSettings;
pub use verdict::{Verdict, VerdictEvaluator};
