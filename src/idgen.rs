//! Job identity generation.
//!
//! Primary path: the kernel CSPRNG via the `getrandom(2)` syscall, called
//! directly through `libc::syscall` rather than going through a wrapper
//! crate. Fallback: a userspace CSPRNG (`rand::rngs::OsRng`) seeding
//! `uuid`'s random-bytes builder, used only if the syscall itself is
//! unavailable (e.g. `ENOSYS` on an old kernel).

use rand::RngCore;
use uuid::Uuid;

/// Generate a UUID v4, kernel-sourced when possible.
pub fn new_job_id() -> Uuid {
    match getrandom_bytes() {
        Some(bytes) => Uuid::from_bytes(to_v4(bytes)),
        None => csprng_fallback(),
    }
}

fn csprng_fallback() -> Uuid {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    Uuid::from_bytes(to_v4(bytes))
}

/// Set the UUID version/variant bits per RFC 4122 §4.4.
fn to_v4(mut bytes: [u8; 16]) -> [u8; 16] {
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    bytes
}

#[cfg(target_os = "linux")]
fn getrandom_bytes() -> Option<[u8; 16]> {
    let mut buf = [0u8; 16];
    // SAFETY: `SYS_getrandom` writes exactly `buf.len()` bytes into `buf`
    // when it returns a value equal to the requested length; `buf` is a
    // valid, appropriately-sized stack buffer for the duration of the call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_getrandom,
            buf.as_mut_ptr(),
            buf.len(),
            0 as libc::c_uint,
        )
    };
    if ret == buf.len() as i64 {
        Some(buf)
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
fn getrandom_bytes() -> Option<[u8; 16]> {
    None
}

/// Validate the canonical `8-4-4-4-12` hex format.
pub fn is_canonical_format(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    let groups = [8, 4, 4, 4, 12];
    let mut pos = 0;
    for (i, &len) in groups.iter().enumerate() {
        if i > 0 {
            if bytes[pos] != b'-' {
                return false;
            }
            pos += 1;
        }
        if !bytes[pos..pos + len].iter().all(u8::is_ascii_hexdigit) {
            return false;
        }
        pos += len;
    }
    pos == bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ten_thousand_ids_are_unique_and_canonical() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = new_job_id();
            assert!(is_canonical_format(&id.to_string()));
            assert!(seen.insert(id), "duplicate UUID generated");
        }
    }

    #[test]
    fn fallback_path_is_also_canonical() {
        for _ in 0..1_000 {
            let id = csprng_fallback();
            assert!(is_canonical_format(&id.to_string()));
            assert_eq!(id.get_version_num(), 4);
        }
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!(!is_canonical_format("not-a-uuid"));
        assert!(!is_canonical_format(""));
    }
}
