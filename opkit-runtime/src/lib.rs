//! Operator runtime for opkit.
//!
//! The pipeline is `ResourceClient` → [`Informer`] → [`InformerController`]
//! → per-pair [`EventQueue`] → [`Reconciler`]. The opinionated layer adds
//! finalizer-backed delete guarantees on top, and [`MultiRunner`] ties the
//! long-running parts into one cooperative lifecycle.

pub mod admission;
pub mod app;
pub mod controller;
pub mod informer;
pub mod opinionated;
pub mod queue;
pub mod ratelimit;
pub mod reconcile;
pub mod runner;
pub mod utils;

pub use admission::AdmissionChain;
pub use app::App;
pub use controller::InformerController;
pub use informer::{EventHandler, Informer, ResourceEvent};
pub use queue::{Coalescible, Disposition, EventQueue, QueuedItem};
pub use reconcile::{
    ObjectState, ReconcileAction, ReconcileError, ReconcileRequest, ReconcileResult, Reconciler,
    StateHint,
};
pub use runner::{MultiRunner, Runnable};
