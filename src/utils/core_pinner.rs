use core_affinity::{CoreId, get_core_ids, set_for_current};

/// Pin the calling thread to `core_id`.
pub fn try_pin_core(core_id: usize) -> anyhow::Result<usize> {
    if let Some(core_ids) = get_core_ids()
        && core_ids.iter().any(|c| c.id == core_id)
        && set_for_current(CoreId { id: core_id })
    {
        return Ok(core_id);
    }
    Err(anyhow::anyhow!("failed to pin thread to core {core_id}"))
}

/// Pick a core for the `slot`-th thread from an optional list, round-robin.
#[inline]
pub fn core_for_slot(core_ids: Option<&[usize]>, slot: usize) -> Option<usize> {
    match core_ids {
        Some(ids) if !ids.is_empty() => Some(ids[slot % ids.len()]),
        _ => None,
    }
}
