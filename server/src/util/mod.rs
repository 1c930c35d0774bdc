/*
 * Created on Wed Feb 14 2024
 *
 * This file is a part of uptimed
 * uptimed is a free and open-source uptime monitoring daemon that probes
 * user-defined services, records the downtime intervals between healthy
 * and failed states and consolidates them into per-service SLA figures.
 *
 * Copyright (c) 2024, The uptimed authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

pub mod error;

use std::{
    process,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

const EXITCODE_ONE: i32 = 0x01;

/// The deepest uninterruptible sleep we allow ourselves. Anything longer is
/// split into quanta so that a stop switch is honored with bounded latency
const SLEEP_QUANTUM: Duration = Duration::from_secs(5);

pub fn exit_error() -> ! {
    process::exit(EXITCODE_ONE)
}

/// Current wallclock time in whole seconds since the epoch
pub fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Sleep for `total`, but wake up every [`SLEEP_QUANTUM`] to check whether a
/// stop was requested. Returns early if `stop` is raised
pub async fn sleep_with_stop(total: Duration, stop: &AtomicBool) {
    let mut left = total;
    while !left.is_zero() {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let nap = left.min(SLEEP_QUANTUM);
        tokio::time::sleep(nap).await;
        left = left.saturating_sub(nap);
    }
}
