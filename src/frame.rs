//! Frame slots and the index/offset bijection.
//!
//! Frame slots are numbered `0 .. aligned_frame_size +
//! parameter_footprint`: parameter slots sit above the saved frame
//! header, local and spill slots inside the frame body. The byte
//! offset mapping must round-trip exactly; both directions assert it.

use std::cell::Cell;

use crate::assembler::BYTES_PER_WORD;
use crate::context::{Context, Local, SiteId, StackNode, ValueId};
use crate::value::remove_site;

/// Byte offset from the stack register for a frame index.
pub fn local_offset(c: &Context, frame_index: u32) -> i32 {
    let parameter_footprint = c.parameter_footprint as i32;
    let frame_size = c.aligned_frame_size as i32;
    let index = frame_index as i32;

    let words = if index < parameter_footprint {
        frame_size + parameter_footprint + c.arch.frame_footer_size() as i32 * 2
            + c.arch.frame_header_size() as i32
            - index
            - 1
    } else {
        frame_size + parameter_footprint + c.arch.frame_footer_size() as i32 - index - 1
    };
    let offset = words * BYTES_PER_WORD as i32;
    assert!(offset >= 0, "frame index {frame_index} maps below the frame");
    offset
}

/// Inverse of [`local_offset`].
pub fn local_offset_to_frame_index(c: &Context, offset: i32) -> u32 {
    let parameter_footprint = c.parameter_footprint as i32;
    let frame_size = c.aligned_frame_size as i32;
    let normalized = offset / BYTES_PER_WORD as i32;

    let index = if normalized > frame_size {
        frame_size + parameter_footprint + c.arch.frame_footer_size() as i32 * 2
            + c.arch.frame_header_size() as i32
            - normalized
            - 1
    } else {
        frame_size + parameter_footprint + c.arch.frame_footer_size() as i32 - normalized - 1
    };
    assert!(index >= 0, "offset {offset} maps outside the frame");
    let index = index as u32;
    assert_eq!(
        local_offset(c, index),
        offset,
        "frame index mapping failed to round-trip"
    );
    index
}

/// Unconditionally evict the slot's current value. The value must
/// still be live; a dead value would have released the slot already.
fn try_steal(c: &mut Context, index: u32) -> bool {
    let r = &c.frame_resources[index as usize];
    let v = r.value.expect("steal from an empty frame slot");
    let site = r.site.unwrap();
    assert!(c.values[v].reads.is_some());

    log::trace!(
        "steal frame index {index} offset {:#x} from {v:?}",
        local_offset(c, index)
    );

    remove_site(c, v, site);
    true
}

/// Bind a frame slot (and its companion for multi-word values) to
/// `value` through `site`.
pub fn acquire_frame_index(
    c: &mut Context,
    index: u32,
    stack: Option<&StackNode<'_>>,
    locals: Option<&[Cell<Local>]>,
    new_size: u32,
    new_value: ValueId,
    new_site: SiteId,
    recurse: bool,
) {
    assert!(
        index < c.aligned_frame_size + c.parameter_footprint,
        "frame index {index} out of range"
    );

    log::trace!(
        "acquire frame index {index} offset {:#x} value {new_value:?} site {new_site:?}",
        local_offset(c, index)
    );

    if recurse && new_size > BYTES_PER_WORD {
        acquire_frame_index(c, index + 1, stack, locals, new_size, new_value, new_site, false);
    }

    let old_value = c.frame_resources[index as usize].value;
    if let Some(old) = old_value {
        let old_site = c.frame_resources[index as usize].site;
        if old != new_value && old_site.is_some_and(|s| crate::value::find_site(c, old, s)) {
            assert!(try_steal(c, index), "frame slot {index} could not be stolen");
        }
    }

    let r = &mut c.frame_resources[index as usize];
    r.size = new_size;
    r.value = Some(new_value);
    r.site = Some(new_site);
}

/// Unbind a frame slot (and its companion for multi-word values).
pub fn release_frame_index(c: &mut Context, index: u32, recurse: bool) {
    assert!(
        index < c.aligned_frame_size + c.parameter_footprint,
        "frame index {index} out of range"
    );

    log::trace!(
        "release frame index {index} offset {:#x}",
        local_offset(c, index)
    );

    if recurse && c.frame_resources[index as usize].size > BYTES_PER_WORD {
        release_frame_index(c, index + 1, false);
    }

    let r = &mut c.frame_resources[index as usize];
    r.size = 0;
    r.value = None;
    r.site = None;
}

// Re-exported here because frame sites are the natural companion of
// the index math.
pub use crate::site::frame_site;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{NullClient, TestArch};
    use bumpalo::Bump;

    #[test]
    fn test_frame_index_offset_round_trip() {
        let arena = Bump::new();
        let arch = TestArch::new();
        let client = NullClient;
        let mut c = Context::new(&arena, &arch, &client);
        c.parameter_footprint = 3;
        c.local_footprint = 2;
        c.aligned_frame_size = 10;

        for i in 0..c.aligned_frame_size + c.parameter_footprint {
            let offset = local_offset(&c, i);
            assert_eq!(local_offset_to_frame_index(&c, offset), i);
        }
    }

    #[test]
    fn test_parameter_slots_sit_above_the_frame_body() {
        let arena = Bump::new();
        let arch = TestArch::new();
        let client = NullClient;
        let mut c = Context::new(&arena, &arch, &client);
        c.parameter_footprint = 2;
        c.aligned_frame_size = 6;

        // Parameters are further from the stack register than any
        // local slot because the frame header sits between them.
        let parameter = local_offset(&c, 0);
        let local = local_offset(&c, 2);
        assert!(parameter > local);
    }

    #[test]
    fn test_offsets_are_distinct_per_index() {
        let arena = Bump::new();
        let arch = TestArch::new();
        let client = NullClient;
        let mut c = Context::new(&arena, &arch, &client);
        c.parameter_footprint = 4;
        c.aligned_frame_size = 12;

        let mut seen = std::collections::HashSet::new();
        for i in 0..c.aligned_frame_size + c.parameter_footprint {
            assert!(seen.insert(local_offset(&c, i)), "offset collision at {i}");
        }
    }
}
