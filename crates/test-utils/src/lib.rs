//! Shared test support for the ironsaga workspace.

pub mod db;
