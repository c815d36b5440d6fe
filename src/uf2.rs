//! UF2 image handling
//!
//! The firmware image carries sentinel words that the gateway's targets use
//! to learn their own position on the test rack: every sentinel is rewritten
//! with the device index before the image is streamed to that device. The
//! sentinel is an ARM HLT instruction with a fixed 16-bit payload, which the
//! target firmware would never contain by accident.

use log::debug;

/// HLT with a 0b1010101010101010 immediate
const SENTINEL: u32 = (0b11010100010 << 21) | (0b1010101010101010 << 5);

/// A UF2 file is a sequence of 512-byte blocks, each wrapping up to 476
/// payload bytes between a 32-byte header and a 4-byte footer.
const BLOCK_SIZE: usize = 512;
const HEADER_SIZE: usize = 32;
const FOOTER_SIZE: usize = 4;

/// A UF2 firmware image with its sentinel locations resolved
#[derive(Debug, Clone)]
pub struct Uf2Image {
    data: Vec<u8>,
    sentinel_offsets: Vec<usize>,
}

impl Uf2Image {
    /// Takes ownership of raw UF2 contents and scans them for sentinels
    pub fn new(data: Vec<u8>) -> Self {
        let sentinel_offsets = locate_sentinels(&data);
        debug!(
            "located {} sentinel word(s) in a {} byte image",
            sentinel_offsets.len(),
            data.len()
        );
        Uf2Image {
            data,
            sentinel_offsets,
        }
    }

    /// Offsets of every sentinel word, in file order
    pub fn sentinel_offsets(&self) -> &[usize] {
        &self.sentinel_offsets
    }

    /// Rewrites every sentinel with the given device index
    ///
    /// The offsets were fixed at scan time, so the image can be re-patched
    /// for each device in turn even though the sentinel bytes are gone after
    /// the first call.
    pub fn patch_for(&mut self, device: u8) {
        for &offset in &self.sentinel_offsets {
            debug!("patching offset {offset} with device id {device}");
            self.data[offset..offset + 4].copy_from_slice(&[device, 0, 0, 0]);
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Scans block payloads for the sentinel word
///
/// Targets emit the sentinel as an instruction, so it sits at a 4-aligned
/// offset within the payload; the scan only probes those positions. Headers
/// and footers are skipped and a trailing partial block is ignored.
fn locate_sentinels(data: &[u8]) -> Vec<usize> {
    let sentinel = SENTINEL.to_le_bytes();
    let mut offsets = Vec::new();

    let mut block_start = 0;
    while block_start + BLOCK_SIZE <= data.len() {
        let payload_end = block_start + BLOCK_SIZE - FOOTER_SIZE;
        let mut offset = block_start + HEADER_SIZE;
        while offset < payload_end {
            if data[offset..offset + 4] == sentinel {
                offsets.push(offset);
            }
            offset += 4;
        }
        block_start += BLOCK_SIZE;
    }

    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENTINEL_LE: [u8; 4] = [0x40, 0x55, 0x55, 0xd4];

    fn image_with_sentinels(blocks: usize, offsets: &[usize]) -> Vec<u8> {
        let mut data = vec![0u8; blocks * BLOCK_SIZE];
        for &offset in offsets {
            data[offset..offset + 4].copy_from_slice(&SENTINEL_LE);
        }
        data
    }

    #[test]
    fn sentinel_constant_matches_the_wire_encoding() {
        assert_eq!(SENTINEL.to_le_bytes(), SENTINEL_LE);
    }

    #[test]
    fn sentinels_are_found_at_aligned_payload_offsets() {
        let data = image_with_sentinels(1, &[32, 40]);
        let image = Uf2Image::new(data);
        assert_eq!(image.sentinel_offsets(), [32, 40]);
    }

    #[test]
    fn sentinels_in_later_blocks_use_absolute_offsets() {
        let data = image_with_sentinels(3, &[BLOCK_SIZE + 36, 2 * BLOCK_SIZE + 32]);
        let image = Uf2Image::new(data);
        assert_eq!(
            image.sentinel_offsets(),
            [BLOCK_SIZE + 36, 2 * BLOCK_SIZE + 32]
        );
    }

    #[test]
    fn unaligned_sentinels_are_not_probed() {
        let data = image_with_sentinels(1, &[34]);
        let image = Uf2Image::new(data);
        assert!(image.sentinel_offsets().is_empty());
    }

    #[test]
    fn headers_and_footers_are_skipped() {
        // Offset 0 sits in the header, offset 508 in the footer.
        let data = image_with_sentinels(1, &[0, BLOCK_SIZE - FOOTER_SIZE]);
        let image = Uf2Image::new(data);
        assert!(image.sentinel_offsets().is_empty());
    }

    #[test]
    fn last_payload_word_is_still_probed() {
        let offset = BLOCK_SIZE - FOOTER_SIZE - 4;
        let data = image_with_sentinels(1, &[offset]);
        let image = Uf2Image::new(data);
        assert_eq!(image.sentinel_offsets(), [offset]);
    }

    #[test]
    fn trailing_partial_blocks_are_ignored() {
        let mut data = image_with_sentinels(1, &[32]);
        data.extend_from_slice(&[0u8; 100]);
        data[BLOCK_SIZE + 36..BLOCK_SIZE + 40].copy_from_slice(&SENTINEL_LE);

        let image = Uf2Image::new(data);
        assert_eq!(image.sentinel_offsets(), [32]);
    }

    #[test]
    fn patching_writes_the_device_index_word() {
        let data = image_with_sentinels(1, &[32, 44]);
        let mut image = Uf2Image::new(data);

        image.patch_for(7);
        assert_eq!(image.bytes()[32..36], [7, 0, 0, 0]);
        assert_eq!(image.bytes()[44..48], [7, 0, 0, 0]);
    }

    #[test]
    fn repatching_overwrites_the_previous_device_index() {
        let data = image_with_sentinels(1, &[32]);
        let mut image = Uf2Image::new(data);

        image.patch_for(7);
        image.patch_for(3);
        assert_eq!(image.bytes()[32..36], [3, 0, 0, 0]);
    }
}
