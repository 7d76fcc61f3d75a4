// Backward LZ decompression for overlay and executable payloads. The
// bookkeeping sits at the tail: a footer word (header-size:8 |
// compressed-size:24) followed by an extra-size word, and the stream decodes
// back-to-front into a buffer of input.len() + extra_size bytes. An extra
// size of zero marks an uncompressed payload, returned unchanged.
// Decompression only; there is no matching compressor.

use anyhow::{Result, ensure};

use crate::error::NitroError;

pub fn decompress(input: &[u8]) -> Result<Vec<u8>> {
    ensure!(
        input.len() >= 8,
        NitroError::MalformedContainer("BLZ payload shorter than its footer")
    );

    let len = input.len();
    let extra = u32::from_le_bytes(input[len - 4..].try_into().unwrap()) as usize;
    if extra == 0 {
        return Ok(input.to_vec());
    }

    let info = u32::from_le_bytes(input[len - 8..len - 4].try_into().unwrap());
    let header_len = (info >> 24) as usize;
    let compressed_len = (info & 0x00FF_FFFF) as usize;
    ensure!(
        compressed_len <= len && header_len <= compressed_len,
        NitroError::MalformedContainer("BLZ footer sizes exceed the payload")
    );

    let raw_len = len - compressed_len;
    let total = len + extra;

    let mut out = vec![0u8; total];
    out[..raw_len].copy_from_slice(&input[..raw_len]);

    // `src` walks backward over input[raw_len..len - header_len];
    // `dst` walks backward over out[raw_len..total].
    let mut src = len - header_len;
    let mut dst = total;

    while dst > raw_len {
        ensure!(src > raw_len, NitroError::OutOfData);
        src -= 1;
        let control = input[src];

        for bit in 0..8 {
            if dst == raw_len {
                break;
            }
            if control & (0x80 >> bit) == 0 {
                // Literal, also read backward.
                ensure!(src > raw_len, NitroError::OutOfData);
                src -= 1;
                dst -= 1;
                out[dst] = input[src];
            } else {
                ensure!(src >= raw_len + 2, NitroError::OutOfData);
                src -= 1;
                let a = input[src];
                src -= 1;
                let b = input[src];

                let count = ((a >> 4) as usize) + 3;
                let mut disp = ((((a & 0x0F) as usize) << 8) | b as usize) + 3;

                let produced = total - dst;
                if disp > produced {
                    // Would read before the start of the produced output.
                    ensure!(produced >= 2, NitroError::OutOfData);
                    disp = 2;
                }

                for _ in 0..count {
                    if dst == raw_len {
                        break;
                    }
                    dst -= 1;
                    out[dst] = out[dst + disp];
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_extra_size_passes_through() {
        let mut input = b"plain payload".to_vec();
        input.extend_from_slice(&0u32.to_le_bytes());
        input.extend_from_slice(&0u32.to_le_bytes());
        let out = decompress(&input).unwrap();
        assert_eq!(out, input);
    }

    // Raw prefix "HELLO", then (reading backward) three literals 'C','B','A'
    // and one back-reference (length 18, displacement 3) repeating them.
    fn sample_stream() -> Vec<u8> {
        let mut input = Vec::new();
        input.extend_from_slice(b"HELLO");
        // Token bytes, stored in reverse read order.
        input.push(0x00); // back-reference low displacement byte
        input.push(0xF0); // length nibble 0xF (= 18), displacement high nibble 0
        input.extend_from_slice(b"ABC"); // literals, read backward as C, B, A
        input.push(0x10); // control byte: literal, literal, literal, back-reference
        // Footer: header size 8, compressed region 14 bytes, 7 extra bytes.
        input.extend_from_slice(&(14u32 | (8u32 << 24)).to_le_bytes());
        input.extend_from_slice(&7u32.to_le_bytes());
        input
    }

    #[test]
    fn decodes_backward_tokens_and_back_references() {
        let input = sample_stream();
        let out = decompress(&input).unwrap();
        let mut expected = b"HELLO".to_vec();
        for _ in 0..7 {
            expected.extend_from_slice(b"ABC");
        }
        assert_eq!(out, expected);
    }

    #[test]
    fn output_length_is_input_plus_extra() {
        let input = sample_stream();
        let out = decompress(&input).unwrap();
        assert_eq!(out.len(), input.len() + 7);
    }

    #[test]
    fn exhausted_source_is_out_of_data() {
        let mut input = Vec::new();
        input.extend_from_slice(b"HELLO");
        input.push(0x00); // control byte: eight literals promised, none present
        input.extend_from_slice(&(9u32 | (8u32 << 24)).to_le_bytes());
        input.extend_from_slice(&16u32.to_le_bytes());
        let err = decompress(&input).unwrap_err();
        assert_eq!(err.downcast::<NitroError>().unwrap(), NitroError::OutOfData);
    }
}
