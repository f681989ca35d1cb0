//! Test utilities shared by the integration tests of `dynamic-grpc`.

pub mod test_server;
