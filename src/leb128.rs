use crate::error::*;

#[inline]
pub fn safe_read_leb128<T>(bytes: &[u8], pc: &mut usize, bits: u8) -> Result<T, Error>
where T: TryFrom<u64> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    let mut end = *pc;
    loop {
        let Some(&byte) = bytes.get(end) else { return malformed(UNEXPECTED_END) };
        end += 1;
        if shift < 64 {
            result |= ((byte & 0x7f) as u64) << shift;
        }
        if byte & 0x80 == 0 { break; }
        shift = shift.saturating_add(7);
    }
    let consumed = end - *pc;
    if consumed > (bits as usize).div_ceil(7) { return malformed(INT_TOO_LONG); }
    if bits < 64 && result >> bits != 0 { return malformed(INT_TOO_LARGE); }
    if consumed > 1 {
        let used = (consumed - 1) * 7;
        let rem = (bits as usize).saturating_sub(used);
        if rem < 7 && (bytes[end - 1] as u32 & 0x7f) >> rem != 0 { return malformed(INT_TOO_LARGE); }
    }
    *pc = end;
    T::try_from(result).or(malformed(INT_TOO_LARGE))
}

#[inline]
pub fn safe_read_sleb128<T>(bytes: &[u8], pc: &mut usize, bits: u8) -> Result<T, Error>
where T: TryFrom<i64> {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    let mut end = *pc;
    let mut byte: u8;
    loop {
        let Some(&b) = bytes.get(end) else { return malformed(UNEXPECTED_END) };
        byte = b;
        end += 1;
        if shift < 64 {
            result |= ((byte & 0x7f) as i64) << shift;
        }
        shift = shift.saturating_add(7);
        if byte & 0x80 == 0 { break; }
    }
    if shift < 64 && (byte & 0x40) != 0 {
        result |= (!0i64) << shift;
    }
    let consumed = end - *pc;
    if consumed > (bits as usize).div_ceil(7) { return malformed(INT_TOO_LONG); }

    match bits {
        32 | 33 => {
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            if result < min || result > max { return malformed(INT_TOO_LARGE); }
        }
        _ => {
            // For 64 bits the last byte may only carry sign-extension bits.
            if consumed == 10 {
                let last = bytes[end - 1];
                if last != 0 && last != 0x7f { return malformed(INT_TOO_LARGE); }
            }
        }
    }
    *pc = end;
    T::try_from(result).or(malformed(INT_TOO_LARGE))
}
