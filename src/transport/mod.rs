/// TCP helpers for the engine connection (dial, accept).
pub mod tcp;
