//! Integration test modules
//!
//! End-to-end coverage of the expression-tree engine:
//! - Literal end-to-end scenarios (standalone rules, both cross-fact
//!   shapes, re-evaluation, cancellation, dependency analysis)
//! - Session lifecycle, phase safety and commit semantics
//! - Property-based invariants (rewriting, ordering, dependencies)

pub mod lifecycle;
pub mod properties;
pub mod scenarios;

use crossfact::{EngineConfig, EngineContext};
use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Engine context over the shared test domain
pub fn domain_context() -> EngineContext {
    init_tracing();
    EngineContext::new(domain::domain_schema())
}

/// Same, with explicit configuration
pub fn domain_context_with(config: EngineConfig) -> EngineContext {
    init_tracing();
    EngineContext::builder()
        .schema(domain::domain_schema())
        .config(config)
        .build()
}
