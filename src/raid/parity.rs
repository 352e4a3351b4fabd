// vim: tw=80
//! Reed-Solomon P/Q/R parity over GF(2⁸), generators 1, 2, 4.
//!
//! The original source left this as a `#ifdef TODO` stub
//! (`vdev_raidz_p_func` and friends, never finished); per the expanded
//! specification's resolution of that open question, this module
//! implements the well-known RAID-Z Galois arithmetic in full rather than
//! leaving a TODO, since completing that design is exactly this crate's
//! job.

use std::sync::OnceLock;

use crate::{
    error::{Error, Result},
    types::PARITY_GENERATORS,
};

/// Primitive polynomial x⁸+x⁴+x³+x²+1, the same one RAID-Z uses.
const GF_POLY: u16 = 0x11d;

struct GfTables {
    exp: [u8; 512],
    log: [u8; 256],
}

fn build_tables() -> GfTables {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    for i in 0..255usize {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= GF_POLY;
        }
    }
    for i in 255..512 {
        exp[i] = exp[i - 255];
    }
    GfTables { exp, log }
}

fn tables() -> &'static GfTables {
    static TABLES: OnceLock<GfTables> = OnceLock::new();
    TABLES.get_or_init(build_tables)
}

/// Multiply two GF(2⁸) elements.
pub fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = tables();
    let i = t.log[a as usize] as usize + t.log[b as usize] as usize;
    t.exp[i]
}

/// Divide `a` by nonzero `b` in GF(2⁸).
pub fn gf_div(a: u8, b: u8) -> u8 {
    assert_ne!(b, 0, "division by zero in GF(2^8)");
    if a == 0 {
        return 0;
    }
    let t = tables();
    let diff = t.log[a as usize] as i32 - t.log[b as usize] as i32;
    let idx = if diff < 0 { diff + 255 } else { diff };
    t.exp[idx as usize]
}

/// Raise `g` to the `e`th power in GF(2⁸).
pub fn gf_pow(g: u8, e: usize) -> u8 {
    if e == 0 {
        return 1;
    }
    if g == 0 {
        return 0;
    }
    let t = tables();
    let idx = (t.log[g as usize] as usize * e) % 255;
    t.exp[idx]
}

fn gf_inv(a: u8) -> u8 {
    gf_div(1, a)
}

fn xor_inplace(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Multiply every byte of `buf` by 2 in GF(2⁸), in place, 8 bytes at a
/// time using the mask-based doubling trick: shift left, then XOR in the
/// reduction polynomial's low byte wherever the vacated high bit was set.
pub fn mul2_inplace(buf: &mut [u8]) {
    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(chunk);
        let v = u64::from_ne_bytes(arr);
        let carries = (v >> 7) & 0x0101_0101_0101_0101;
        let shifted = (v << 1) & 0xfefe_fefe_fefe_fefe;
        let result = shifted ^ (carries * 0x1d);
        chunk.copy_from_slice(&result.to_ne_bytes());
    }
    for b in chunks.into_remainder() {
        *b = mul2(*b);
    }
}

fn mul2(b: u8) -> u8 {
    let hi = b & 0x80;
    let shifted = b.wrapping_shl(1);
    if hi != 0 {
        shifted ^ 0x1d
    } else {
        shifted
    }
}

/// Multiply every byte of `buf` by 4 (`2²`) in place.
pub fn mul4_inplace(buf: &mut [u8]) {
    mul2_inplace(buf);
    mul2_inplace(buf);
}

/// Scale every byte of `buf` by a constant GF(2⁸) coefficient, in place.
pub fn scale_inplace(buf: &mut [u8], coeff: u8) {
    match coeff {
        0 => buf.fill(0),
        1 => {}
        2 => mul2_inplace(buf),
        4 => mul4_inplace(buf),
        c => {
            for b in buf.iter_mut() {
                *b = gf_mul(*b, c);
            }
        }
    }
}

/// Generate `nparity` parity buffers (P[, Q[, R]]) from `ndata` data
/// column buffers, all of the same length. Uses Horner's rule over
/// GF(2⁸): `Q = D_0 ⊕ 2·(D_1 ⊕ 2·(D_2 ⊕ ... ⊕ 2·D_{n-1}))`, equivalent to
/// the closed-form `Q = ⊕ᵢ 2ⁱ·Dᵢ` but computed in O(ndata) multiplies
/// instead of O(ndata²).
pub fn generate(data: &[&[u8]], nparity: u8) -> Vec<Vec<u8>> {
    let size = data.first().map_or(0, |d| d.len());
    let mut out = Vec::with_capacity(nparity as usize);
    out.push(horner(data, size, |_| {}));
    if nparity >= 2 {
        out.push(horner(data, size, mul2_inplace));
    }
    if nparity >= 3 {
        out.push(horner(data, size, mul4_inplace));
    }
    out
}

fn horner(data: &[&[u8]], size: usize, mulfn: impl Fn(&mut [u8])) -> Vec<u8> {
    let mut acc = vec![0u8; size];
    for d in data.iter().rev() {
        mulfn(&mut acc);
        xor_inplace(&mut acc, d);
    }
    acc
}

/// Recompute parity for a row undergoing read-modify-write, from the old
/// parity and the set of data columns that changed. `P_new = P_old ⊕
/// D_old ⊕ D_new`; Q and R apply the same linear update scaled by their
/// column's Vandermonde coefficient (`generator^data_col_index`).
pub fn update_parity(
    old_parities: &[&[u8]],
    changes: &[(usize, &[u8], &[u8])],
    nparity: u8,
) -> Vec<Vec<u8>> {
    let mut out: Vec<Vec<u8>> = old_parities.iter().map(|p| p.to_vec()).collect();
    for &(col_idx, old_d, new_d) in changes {
        let mut delta = old_d.to_vec();
        xor_inplace(&mut delta, new_d);
        xor_inplace(&mut out[0], &delta);
        if nparity >= 2 {
            let mut scaled = delta.clone();
            scale_inplace(&mut scaled, gf_pow(PARITY_GENERATORS[1], col_idx));
            xor_inplace(&mut out[1], &scaled);
        }
        if nparity >= 3 {
            let mut scaled = delta;
            scale_inplace(&mut scaled, gf_pow(PARITY_GENERATORS[2], col_idx));
            xor_inplace(&mut out[2], &scaled);
        }
    }
    out
}

/// Compare read-back parity against parity recomputed from the
/// corresponding data columns; return the generator indices (0=P, 1=Q,
/// 2=R) of any columns that disagree.
pub fn verify(data: &[&[u8]], parity: &[&[u8]]) -> Vec<u8> {
    let nparity = parity.len() as u8;
    let computed = generate(data, nparity);
    (0..nparity as usize)
        .filter(|&i| computed[i] != parity[i])
        .map(|i| i as u8)
        .collect()
}

/// One surviving parity column available for reconstruction.
pub struct ParitySource<'a> {
    /// 0=P, 1=Q, 2=R.
    pub generator_idx: u8,
    pub buf: &'a [u8],
}

/// Reconstruct `missing_data_cols` from whatever data columns survived
/// plus enough parity columns to form a solvable system. Builds a small
/// Vandermonde matrix restricted to the missing columns and inverts it
/// with Gauss-Jordan elimination over GF(2⁸) (the one algorithm this
/// crate uses for single/double/triple-target reconstruction alike,
/// since at `nparity <= 3` the specialized closed forms are a
/// performance optimization over the general solver, not a distinct
/// correctness path -- see DESIGN.md).
pub fn reconstruct(
    present_data: &[(usize, &[u8])],
    parity_sources: &[ParitySource],
    missing_data_cols: &[usize],
    size: usize,
) -> Result<Vec<(usize, Vec<u8>)>> {
    let m = missing_data_cols.len();
    if m == 0 {
        return Ok(Vec::new());
    }
    if parity_sources.len() < m {
        return Err(Error::Unrecoverable {
            row: 0,
            missing: m,
            nparity: parity_sources.len() as u8,
        });
    }
    let chosen = &parity_sources[..m];

    let mut a = vec![0u8; m * m];
    for (j, ps) in chosen.iter().enumerate() {
        let g = PARITY_GENERATORS[ps.generator_idx as usize];
        for (k, &col) in missing_data_cols.iter().enumerate() {
            a[j * m + k] = gf_pow(g, col);
        }
    }
    let inv = invert(&a, m).ok_or(Error::Unrecoverable {
        row: 0,
        missing: m,
        nparity: parity_sources.len() as u8,
    })?;

    let mut rhs: Vec<Vec<u8>> = Vec::with_capacity(m);
    for ps in chosen {
        let g = PARITY_GENERATORS[ps.generator_idx as usize];
        let mut v = ps.buf.to_vec();
        for &(i, d) in present_data {
            let mut scaled = d.to_vec();
            scale_inplace(&mut scaled, gf_pow(g, i));
            xor_inplace(&mut v, &scaled);
        }
        rhs.push(v);
    }

    let mut result = Vec::with_capacity(m);
    for (k, &col) in missing_data_cols.iter().enumerate() {
        let mut out = vec![0u8; size];
        for (j, rhs_j) in rhs.iter().enumerate() {
            let coeff = inv[k * m + j];
            if coeff == 0 {
                continue;
            }
            let mut scaled = rhs_j.clone();
            scale_inplace(&mut scaled, coeff);
            xor_inplace(&mut out, &scaled);
        }
        result.push((col, out));
    }
    Ok(result)
}

/// Gauss-Jordan inversion of an `n x n` matrix over GF(2⁸), row-major.
fn invert(matrix: &[u8], n: usize) -> Option<Vec<u8>> {
    let mut a = matrix.to_vec();
    let mut inv = vec![0u8; n * n];
    for i in 0..n {
        inv[i * n + i] = 1;
    }

    for col in 0..n {
        let pivot_row = (col..n).find(|&r| a[r * n + col] != 0)?;
        if pivot_row != col {
            for c in 0..n {
                a.swap(col * n + c, pivot_row * n + c);
                inv.swap(col * n + c, pivot_row * n + c);
            }
        }
        let pivot_inv = gf_inv(a[col * n + col]);
        for c in 0..n {
            a[col * n + c] = gf_mul(a[col * n + c], pivot_inv);
            inv[col * n + c] = gf_mul(inv[col * n + c], pivot_inv);
        }
        for r in 0..n {
            if r == col {
                continue;
            }
            let factor = a[r * n + col];
            if factor == 0 {
                continue;
            }
            for c in 0..n {
                let a_sub = gf_mul(factor, a[col * n + c]);
                a[r * n + c] ^= a_sub;
                let inv_sub = gf_mul(factor, inv[col * n + c]);
                inv[r * n + c] ^= inv_sub;
            }
        }
    }
    Some(inv)
}

#[cfg(test)]
mod t {
    use super::*;

    #[test]
    fn gf_mul_matches_known_products() {
        assert_eq!(gf_mul(0, 200), 0);
        assert_eq!(gf_mul(1, 200), 200);
        assert_eq!(gf_mul(2, 1), 2);
        assert_eq!(gf_div(gf_mul(37, 201), 201), 37);
    }

    #[test]
    fn gf_pow_matches_repeated_mul() {
        for g in [2u8, 4u8] {
            let mut expect = 1u8;
            for e in 0..20usize {
                assert_eq!(gf_pow(g, e), expect);
                expect = gf_mul(expect, g);
            }
        }
    }

    #[test]
    fn mul2_matches_byte_formula() {
        let mut buf: Vec<u8> = (0..=255u8).collect();
        let expected: Vec<u8> = buf.iter().map(|&b| mul2(b)).collect();
        mul2_inplace(&mut buf);
        assert_eq!(buf, expected);
    }

    #[test]
    fn invert_recovers_identity() {
        let id = {
            let mut m = vec![0u8; 9];
            for i in 0..3 {
                m[i * 3 + i] = 1;
            }
            m
        };
        assert_eq!(invert(&id, 3).unwrap(), id);
    }

    #[test]
    fn generate_then_verify_is_clean() {
        let d0 = vec![1u8, 2, 3, 4];
        let d1 = vec![5u8, 6, 7, 8];
        let d2 = vec![9u8, 10, 11, 12];
        let data: Vec<&[u8]> = vec![&d0, &d1, &d2];
        let parity = generate(&data, 3);
        let parity_refs: Vec<&[u8]> = parity.iter().map(|p| p.as_slice()).collect();
        assert!(verify(&data, &parity_refs).is_empty());
    }

    #[test]
    fn verify_flags_corrupted_parity() {
        let d0 = vec![1u8, 2, 3, 4];
        let d1 = vec![5u8, 6, 7, 8];
        let data: Vec<&[u8]> = vec![&d0, &d1];
        let mut parity = generate(&data, 2);
        parity[1][0] ^= 0xff;
        let parity_refs: Vec<&[u8]> = parity.iter().map(|p| p.as_slice()).collect();
        assert_eq!(verify(&data, &parity_refs), vec![1]);
    }

    #[test]
    fn update_parity_matches_full_regenerate() {
        let ndata = 4;
        let size = 16;
        let old_data: Vec<Vec<u8>> =
            (0..ndata).map(|i| vec![i as u8 * 7 + 1; size]).collect();
        let old_refs: Vec<&[u8]> = old_data.iter().map(|d| d.as_slice()).collect();
        let old_parity = generate(&old_refs, 2);

        let mut new_data = old_data.clone();
        new_data[2] = vec![0x42u8; size];
        let new_refs: Vec<&[u8]> = new_data.iter().map(|d| d.as_slice()).collect();
        let expected = generate(&new_refs, 2);

        let old_parity_refs: Vec<&[u8]> = old_parity.iter().map(|p| p.as_slice()).collect();
        let changes: Vec<(usize, &[u8], &[u8])> =
            vec![(2, old_data[2].as_slice(), new_data[2].as_slice())];
        let updated = update_parity(&old_parity_refs, &changes, 2);
        assert_eq!(updated, expected);
    }

    #[test]
    fn reconstruct_single_missing_data_column_via_p() {
        let d0 = vec![11u8, 22, 33, 44];
        let d1 = vec![55u8, 66, 77, 88];
        let d2 = vec![99u8, 111, 122, 133];
        let data: Vec<&[u8]> = vec![&d0, &d1, &d2];
        let parity = generate(&data, 2);

        let present: Vec<(usize, &[u8])> = vec![(0, &d0), (2, &d2)];
        let sources = vec![ParitySource { generator_idx: 0, buf: &parity[0] }];
        let recovered = reconstruct(&present, &sources, &[1], d1.len()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].0, 1);
        assert_eq!(recovered[0].1, d1);
    }

    #[test]
    fn reconstruct_two_missing_data_columns_via_pq() {
        let d0 = vec![1u8, 2, 3, 4];
        let d1 = vec![200u8, 201, 202, 203];
        let d2 = vec![9u8, 8, 7, 6];
        let d3 = vec![250u8, 17, 90, 3];
        let data: Vec<&[u8]> = vec![&d0, &d1, &d2, &d3];
        let parity = generate(&data, 2);

        let present: Vec<(usize, &[u8])> = vec![(1, &d1), (3, &d3)];
        let sources = vec![
            ParitySource { generator_idx: 0, buf: &parity[0] },
            ParitySource { generator_idx: 1, buf: &parity[1] },
        ];
        let recovered = reconstruct(&present, &sources, &[0, 2], d0.len()).unwrap();
        let mut recovered: Vec<_> = recovered.into_iter().collect();
        recovered.sort_by_key(|(c, _)| *c);
        assert_eq!(recovered[0], (0, d0.clone()));
        assert_eq!(recovered[1], (2, d2.clone()));
    }

    #[test]
    fn reconstruct_three_missing_data_columns_via_pqr() {
        let cols: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i * 37 + 3; 8]).collect();
        let refs: Vec<&[u8]> = cols.iter().map(|c| c.as_slice()).collect();
        let parity = generate(&refs, 3);

        let present: Vec<(usize, &[u8])> = vec![(1, &cols[1]), (4, &cols[4])];
        let sources = vec![
            ParitySource { generator_idx: 0, buf: &parity[0] },
            ParitySource { generator_idx: 1, buf: &parity[1] },
            ParitySource { generator_idx: 2, buf: &parity[2] },
        ];
        let missing = [0usize, 2, 3];
        let recovered = reconstruct(&present, &sources, &missing, 8).unwrap();
        let mut recovered = recovered;
        recovered.sort_by_key(|(c, _)| *c);
        for (idx, (col, buf)) in recovered.into_iter().enumerate() {
            assert_eq!(col, missing[idx]);
            assert_eq!(buf, cols[missing[idx]]);
        }
    }

    #[test]
    fn reconstruct_fails_when_not_enough_parity() {
        let d0 = vec![1u8; 4];
        let d1 = vec![2u8; 4];
        let data: Vec<&[u8]> = vec![&d0, &d1];
        let parity = generate(&data, 1);
        let present: Vec<(usize, &[u8])> = vec![];
        let sources = vec![ParitySource { generator_idx: 0, buf: &parity[0] }];
        let res = reconstruct(&present, &sources, &[0, 1], 4);
        assert!(res.is_err());
    }
}
