//! Name-binding verification and repair

pub mod reconciler;

pub use reconciler::{
    proof_scheme_flag, BindingReconciler, BindingState, NameBinding, ReconcileReport, BINDING_KEY,
};
