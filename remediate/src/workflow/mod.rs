//! Approval-gated remediation workflow.
//!
//! Layering, leaf first: [`activity`] wraps every collaborator call with bounded
//! retry, [`gate`] waits for approval, [`pipeline`] runs one cycle, and
//! [`scheduler`] repeats cycles according to the trigger. All time, signal and
//! persistence access goes through the [`substrate::Substrate`] trait.

pub mod activity;
pub mod collaborators;
pub mod error;
pub mod gate;
pub mod pipeline;
pub mod scheduler;
pub mod substrate;
