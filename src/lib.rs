// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! Constant-throughput HTTP/1.1 load generation.
//!
//! pelt drives a target at a fixed request rate across many persistent
//! connections, multiplexed on one readiness reactor per worker thread.
//! Response latency is recorded twice: against the actual send time, and
//! against the *expected* send time under the paced schedule, so server
//! stalls are not hidden by coordinated omission.

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod net;
pub mod pacer;
pub mod parser;
pub mod phase;
pub mod reactor;
pub mod report;
pub mod script;
pub mod stats;
pub mod time;
pub mod worker;
