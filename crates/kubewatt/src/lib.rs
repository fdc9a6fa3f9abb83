//! KubeWatt process: HTTP surface shared by the binary and its tests

pub mod api;
