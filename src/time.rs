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

//! Monotonic microsecond clock

use std::sync::OnceLock;
use std::time::Instant;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Pins the clock origin. Call once at startup so that all timestamps taken
/// afterwards are strictly greater than zero; zero doubles as the "unset"
/// sentinel for per-connection timestamps.
pub fn init() {
    ORIGIN.get_or_init(Instant::now);
}

/// Microseconds elapsed since [`init`] was first called.
#[inline]
pub fn now_us() -> u64 {
    ORIGIN.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Milliseconds elapsed since [`init`] was first called.
#[inline]
pub fn now_ms() -> u64 {
    now_us() / 1000
}

#[cfg(test)]
mod test {
    use super::now_us;

    #[test]
    fn now_us_is_monotonic() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }
}
