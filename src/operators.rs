//! Integer operator semantics.
//!
//! The IR's MOD, shift and rotate operators are specified independently of
//! the host platform, so they are implemented explicitly here rather than
//! leaning on Rust's native operators. All arithmetic is on 32-bit values;
//! overflow wraps.

use crate::diag::Diagnostics;

/// Number of bits in the word the operators work on.
pub const WORD_BITS: i32 = 32;

/// Non-negative remainder: the result of `modulo(a, b)` is `a % b` shifted
/// into `[0, |b|)` for positive `b`.
pub fn modulo(a: i32, b: i32) -> i32 {
    let mut m = a.wrapping_rem(b);
    if m < 0 {
        m = m.wrapping_add(b);
    }
    m
}

/// Logical right shift, filling with zeros. Shifts of the full word width or
/// more collapse to 0 or all-ones depending on the sign of `a`.
pub fn lsr(a: i32, n: i32, diag: &mut Diagnostics) -> i32 {
    if n < 0 {
        diag.warning(format!("Right shift of size {n} is too small."));
        return sign_collapse(a);
    }
    if n >= WORD_BITS {
        if n > WORD_BITS {
            diag.warning(format!("Right shift of size {n} is too big."));
        }
        return sign_collapse(a);
    }
    ((a as u32) >> n as u32) as i32
}

/// Logical left shift. The shift amount is taken modulo the word width.
pub fn lsl(a: i32, n: i32) -> i32 {
    a.wrapping_shl(n as u32)
}

/// Arithmetic right shift: sign-fill for negative `a`, identical to `lsr`
/// for non-negative `a`.
pub fn asr(a: i32, n: i32, diag: &mut Diagnostics) -> i32 {
    let logical = lsr(a, n, diag);
    if a >= 0 || n == 0 {
        logical
    } else if (1..WORD_BITS).contains(&n) {
        logical | lsl(!0, WORD_BITS - n)
    } else {
        !0
    }
}

/// Bit rotation: positive `n` rotates left, negative rotates right, zero is
/// the identity.
pub fn rot(a: i32, n: i32) -> i32 {
    if n > 0 {
        (a as u32).rotate_left(n as u32 % WORD_BITS as u32) as i32
    } else if n == 0 {
        a
    } else {
        (a as u32).rotate_right((-n) as u32 % WORD_BITS as u32) as i32
    }
}

fn sign_collapse(a: i32) -> i32 {
    if a >= 0 {
        0
    } else {
        !0
    }
}
