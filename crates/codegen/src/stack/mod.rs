//! Stack frame layout and the stack-pointer subsystem.

pub mod bias;
pub mod fix;

pub use bias::sim_stack_pointer;
pub use fix::fix_stack_nodes;

use std::cmp::Ordering;

use opal_ir::{EntityKind, FrameState, FrameType};

/// Rounds `x` up so that `x + misalign` is a multiple of `align` (a power
/// of two).
pub(crate) fn round_up_misaligned(x: u32, align: u32, misalign: u32) -> u32 {
    round_up2(x + misalign, align) - misalign
}

fn round_up2(x: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (x + align - 1) & !(align - 1)
}

/// Stably groups the frame members: spill slots before or after the
/// ordinary entities per `spillslots_first`, creation order (`nr`) within
/// each group. Grouping the slots keeps their aliasing relationship with
/// the locals predictable and clusters them for locality.
pub fn sort_frame_entities(frame: &mut FrameType, spillslots_first: bool) {
    frame.sort_members_by(|a, b| {
        let group = |is_slot: bool| is_slot != spillslots_first;
        match group(a.is_spill_slot()).cmp(&group(b.is_spill_slot())) {
            Ordering::Equal => a.nr.cmp(&b.nr),
            ord => ord,
        }
    });
}

/// Assigns offsets to the members without one, laying out downward from
/// `begin` (the stack grows toward smaller addresses). Pre-assigned
/// members keep their offset; the cursor starts below the lowest of them
/// so nothing overlaps. Calling this again is a no-op.
pub fn layout_frame_type(frame: &mut FrameType, begin: i32, misalign: u32) {
    let mut offset = begin;
    for &member in frame.members() {
        if let Some(assigned) = frame.entity(member).offset {
            offset = offset.min(assigned);
        }
    }

    let members: Vec<_> = frame.members().to_vec();
    for member in members {
        let entity = frame.entity(member);
        if entity.offset.is_some() {
            continue;
        }

        let (size, align) = match entity.kind {
            EntityKind::SpillSlot { size } => (size, entity.align),
            EntityKind::Local { size, ty_align } => (size, entity.align.max(ty_align)),
        };

        offset -= size as i32;
        offset = -(round_up_misaligned((-offset) as u32, align, misalign) as i32);
        frame.entity_mut(member).offset = Some(offset);
    }

    frame.size = (-offset).max(0) as u32;
    frame.state = FrameState::LayoutFixed;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every assigned entity ends before the next one above it starts.
    fn assert_no_overlap(frame: &FrameType) {
        let mut spans: Vec<(i32, i32)> = frame
            .members()
            .iter()
            .map(|&m| {
                let e = frame.entity(m);
                let size = match e.kind {
                    EntityKind::SpillSlot { size } => size,
                    EntityKind::Local { size, .. } => size,
                };
                let offset = e.offset.expect("unassigned entity after layout");
                (offset, offset + size as i32)
            })
            .collect();
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "entities overlap: {pair:?}");
        }
    }

    #[test]
    fn layout_respects_preassigned_members() {
        let mut frame = FrameType::new();
        let e1 = frame.new_spill_slot(8, 8);
        let e2 = frame.new_spill_slot(4, 4);
        let e3 = frame.new_spill_slot(16, 16);
        frame.entity_mut(e2).offset = Some(-12);

        layout_frame_type(&mut frame, 0, 0);

        assert_eq!(frame.entity(e2).offset, Some(-12));
        assert_eq!(frame.entity(e1).offset, Some(-24));
        assert_eq!(frame.entity(e3).offset, Some(-48));
        assert_eq!(frame.size, 48);
        assert_eq!(frame.state, FrameState::LayoutFixed);
        assert_no_overlap(&frame);
    }

    #[test]
    fn layout_twice_is_a_no_op() {
        let mut frame = FrameType::new();
        let a = frame.new_spill_slot(8, 8);
        let b = frame.new_local(4, 4, 4);

        layout_frame_type(&mut frame, 0, 0);
        let first = (frame.entity(a).offset, frame.entity(b).offset, frame.size);

        layout_frame_type(&mut frame, 0, 0);
        assert_eq!(
            first,
            (frame.entity(a).offset, frame.entity(b).offset, frame.size)
        );
    }

    #[test]
    fn misalign_shifts_the_rounding() {
        let mut frame = FrameType::new();
        let a = frame.new_spill_slot(8, 16);

        // With 8 bytes of residual misalignment, offset + misalign must be
        // 16-aligned rather than the offset itself.
        layout_frame_type(&mut frame, 0, 8);
        let offset = frame.entity(a).offset.unwrap();
        assert_eq!(offset, -8);
        assert_eq!((-offset + 8) % 16, 0);
    }

    #[test]
    fn local_alignment_takes_the_type_into_account() {
        let mut frame = FrameType::new();
        let a = frame.new_local(4, 1, 8);

        layout_frame_type(&mut frame, 0, 0);
        assert_eq!(frame.entity(a).offset, Some(-8));
        assert_eq!(frame.size, 8);
    }

    #[test]
    fn spillslots_first_groups_by_nr() {
        let mut frame = FrameType::new();
        let l0 = frame.new_local(4, 4, 4);
        let s0 = frame.new_spill_slot(8, 8);
        let l1 = frame.new_local(4, 4, 4);
        let s1 = frame.new_spill_slot(8, 8);

        sort_frame_entities(&mut frame, true);
        assert_eq!(frame.members(), &[s0, s1, l0, l1]);

        sort_frame_entities(&mut frame, false);
        assert_eq!(frame.members(), &[l0, l1, s0, s1]);
    }

    #[test]
    fn slot_only_frame_lays_out_in_nr_order() {
        let mut frame = FrameType::new();
        let s0 = frame.new_spill_slot(8, 8);
        let s1 = frame.new_spill_slot(8, 8);
        let s2 = frame.new_spill_slot(8, 8);

        sort_frame_entities(&mut frame, true);
        layout_frame_type(&mut frame, 0, 0);

        // Offsets descend with the creation ordinal.
        assert_eq!(frame.entity(s0).offset, Some(-8));
        assert_eq!(frame.entity(s1).offset, Some(-16));
        assert_eq!(frame.entity(s2).offset, Some(-24));
        assert_eq!(frame.size, 24);
        assert_no_overlap(&frame);
    }
}
