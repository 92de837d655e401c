//! rkp provisions NFS backed persistent volumes for rk8s storage claims.

pub mod api;
pub mod cli;
pub mod controller;
pub mod leader;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod volume;
