//! Scenario navigation: step transitions scored by embedding similarity,
//! loop suppression, re-localization recovery, and scenario-version
//! reconciliation.
//!
//! Everything here is deterministic given the capability traits
//! ([`Embedder`], [`Adjudicator`]); the LLM/embedding providers behind them
//! are external collaborators.

pub mod embedding;
pub mod navigator;
pub mod reconcile;
pub mod relocalize;

pub use embedding::{cosine_similarity, Embedder, KeywordEmbedder};
pub use navigator::{
    Adjudication, AdjudicationRequest, Adjudicator, NavContext, NavDecision, NavOutcome,
    Navigator, ScenarioSignal,
};
pub use reconcile::{reconcile_scenario, ReconcileReport, Reconciliation};
pub use relocalize::relocalize;
