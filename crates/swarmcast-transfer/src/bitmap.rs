/// 64-bit window bitmap arithmetic.
///
/// Bit `i` of a window bitmap stands for the `i`-th chunk of that window.
/// Polarity is "received" in receiver-side state and "missing" in NACK and
/// need_retransmit fields; the same helpers serve both because the Master
/// aggregates missing-bitmaps with plain bitwise OR.

/// Bitmap with the low `chunks` bits set. `chunks` is the number of chunks
/// actually present in the window; the all-64 case is handled explicitly
/// because `1u64 << 64` is not a defined shift.
pub fn expected_bitmap(chunks: u16) -> u64 {
    debug_assert!(chunks <= 64);
    if chunks >= 64 {
        u64::MAX
    } else {
        (1u64 << chunks) - 1
    }
}

/// True when `other` requests a superset of `mine`: every chunk missing for
/// us is also missing for them, so their NACK already covers ours.
pub fn covers(other: u64, mine: u64) -> bool {
    (mine & other) == mine
}

/// Offsets (within the window) of the set bits, low to high.
pub fn set_offsets(bitmap: u64) -> impl Iterator<Item = u16> {
    (0u16..64).filter(move |&i| bitmap & (1u64 << i) != 0)
}
