//! Library half of the `listenledger` daemon, split out so the HTTP surface
//! can be driven from integration tests.

pub mod http;
