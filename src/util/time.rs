//! `timeval` conversions for the socket timeout options.

use nix::errno::Errno;

const MS_PER_SEC: i64 = 1_000;
const US_PER_MS: i64 = 1_000;
const US_PER_SEC: i64 = 1_000_000;

/// Convert a `timeval` to whole milliseconds, rounding the microseconds up.
///
/// A zero `timeval` converts to 0, which the socket layer treats as
/// "no timeout". Negative or out-of-range components are rejected with
/// `EDOM`, as is a product that does not fit in a `u32` of milliseconds.
pub fn timeval_to_ms(tv: &libc::timeval) -> Result<u32, Errno> {
    let sec = tv.tv_sec as i64;
    let usec = tv.tv_usec as i64;
    if sec < 0 || !(0..US_PER_SEC).contains(&usec) {
        return Err(Errno::EDOM);
    }
    let ms = sec
        .checked_mul(MS_PER_SEC)
        .and_then(|ms| ms.checked_add((usec + (US_PER_MS - 1)) / US_PER_MS))
        .ok_or(Errno::EDOM)?;
    u32::try_from(ms).map_err(|_| Errno::EDOM)
}

/// Convert stored milliseconds back to a `timeval`. 0 reads back as zero.
pub fn ms_to_timeval(ms: u32) -> libc::timeval {
    libc::timeval {
        tv_sec: (ms as i64 / MS_PER_SEC) as libc::time_t,
        tv_usec: ((ms as i64 % MS_PER_SEC) * US_PER_MS) as libc::suseconds_t,
    }
}
