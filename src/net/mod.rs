// This file is part of Ippoc Gate and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

/// Frame links consumed by the handshake drivers.
pub mod link;
/// Trust-tiered packet rate limiter.
pub mod ratelimit;

pub use link::{Link, LinkError, MemoryLink, MAX_FRAME_SIZE};
pub use ratelimit::{RateLimitParams, RateLimiter};
