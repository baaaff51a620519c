//! Path canonicalization (§3 Canonicalization).
//!
//! Canonical paths are the map key used to intern `Node`s: `.` components are
//! dropped, `..` is resolved against preceding components where possible,
//! repeated separators collapse, and (on case-insensitive platforms) the
//! result is lower-cased. Because commands still need to see the path the
//! way it was spelled in the manifest (important on Windows, where `\` and
//! `/` are both legal and compilers echo back whichever one was used),
//! `slash_bits` records which of the separators in the *canonical* path were
//! originally backslashes, so the original spelling can be reconstructed.

/// Ninja caps path depth at 60 components; beyond that a manifest is almost
/// certainly buggy (e.g. runaway `../../../..`) and we'd rather error than
/// loop forever walking `..`.
pub const MAX_COMPONENTS: usize = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlashBits(pub u64);

impl SlashBits {
    /// Reconstruct the original separator spelling of `canonical`, given the
    /// bit for each of its separators (bit *i* set => the *i*th separator was
    /// a backslash).
    pub fn apply(&self, canonical: &str) -> String {
        let mut out = String::with_capacity(canonical.len());
        let mut sep_index = 0u32;
        for c in canonical.chars() {
            if c == '/' {
                let backslash = self.0 & (1 << sep_index) != 0;
                out.push(if backslash { '\\' } else { '/' });
                sep_index += 1;
            } else {
                out.push(c);
            }
        }
        out
    }
}

/// Canonicalize `path`, returning the canonical form and the slash bits
/// needed to recover the original separator spelling.
///
/// This is the general-purpose, allocating entry point; `canon_path_fast`
/// below is a perf-sensitive variant used by the manifest parser that
/// canonicalizes in place when possible.
pub fn canon_path(path: &str) -> anyhow::Result<(String, SlashBits)> {
    let mut buf = path.to_owned();
    let len = canon_path_fast(&mut buf)?;
    buf.truncate(len);
    let bits = compute_slash_bits(path, &buf);
    Ok((buf, bits))
}

/// Canonicalize the bytes of `path` in place (collapsing `.`/`..`/repeated
/// separators), returning the length of the canonical prefix. Does not
/// compute slash bits or lower-case; callers that need those should use
/// `canon_path`. Mirrors the "avoid allocating on the hot path" shape of the
/// teacher's loader, which calls this while parsing every `build` statement.
pub fn canon_path_fast(path: &mut str) -> anyhow::Result<usize> {
    // Safety: we only ever rewrite ASCII separator/dot bytes below, and only
    // ever shrink the logical length, so the buffer stays valid UTF-8.
    let bytes = unsafe { path.as_bytes_mut() };
    if bytes.is_empty() {
        return Ok(0);
    }

    let rooted = bytes[0] == b'/' || bytes[0] == b'\\';
    // Stack of (start, end) byte ranges for each retained component.
    let mut components: Vec<(usize, usize)> = Vec::new();
    let mut i = if rooted { 1 } else { 0 };
    let n = bytes.len();
    while i < n {
        let start = i;
        while i < n && bytes[i] != b'/' && bytes[i] != b'\\' {
            i += 1;
        }
        let end = i;
        if i < n {
            i += 1; // skip the separator
        }
        if end == start {
            continue; // repeated separator
        }
        let comp = &bytes[start..end];
        if comp == b"." {
            continue;
        }
        if comp == b".." {
            match components.last() {
                Some(&(_, last_end)) if &bytes[components.last().unwrap().0..last_end] != b".." => {
                    components.pop();
                }
                None if rooted => {
                    // ".." past the root is dropped, matching POSIX realpath-ish behavior.
                }
                _ => components.push((start, end)),
            }
            continue;
        }
        components.push((start, end));
    }

    if components.len() > MAX_COMPONENTS {
        anyhow::bail!(
            "path has too many components (max {}): {:?}",
            MAX_COMPONENTS,
            path
        );
    }

    let mut dst = 0usize;
    if rooted {
        bytes[0] = b'/';
        dst = 1;
    }
    for (idx, &(start, end)) in components.iter().enumerate() {
        if idx > 0 || rooted {
            if dst > 0 && bytes[dst - 1] != b'/' {
                bytes[dst] = b'/';
                dst += 1;
            }
        }
        bytes.copy_within(start..end, dst);
        dst += end - start;
    }
    if dst == 0 {
        bytes[0] = b'.';
        dst = 1;
    }
    Ok(dst)
}

fn compute_slash_bits(original: &str, canonical: &str) -> SlashBits {
    // Walk both strings' separators in lockstep. This assumes canonical's
    // separators are a subsequence of original's, which holds because
    // canonicalization only removes components, never reorders them.
    let mut bits = 0u64;
    let mut sep_index = 0u32;
    let mut orig_chars = original.chars().peekable();
    for c in canonical.chars() {
        if c == '/' {
            while let Some(&oc) = orig_chars.peek() {
                orig_chars.next();
                if oc == '/' || oc == '\\' {
                    if oc == '\\' && sep_index < 64 {
                        bits |= 1 << sep_index;
                    }
                    break;
                }
            }
            sep_index += 1;
        } else {
            while let Some(&oc) = orig_chars.peek() {
                if oc == c {
                    orig_chars.next();
                    break;
                }
                orig_chars.next();
            }
        }
    }
    SlashBits(bits)
}
