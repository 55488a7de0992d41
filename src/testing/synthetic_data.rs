//! Synthetic frames for offline tests

use crate::types::Frame;

/// Frame with every channel set to `value`
pub fn solid_frame(width: u32, height: u32, value: u8) -> Frame {
    Frame::new(vec![value; (width * height * 3) as usize], width, height)
}

/// RGB gradient that shifts with `frame_number`, so consecutive frames differ
pub fn gradient_frame(width: u32, height: u32, frame_number: u64) -> Frame {
    let mut data = vec![0u8; (width * height * 3) as usize];
    let base = (frame_number % 256) as u8;
    for y in 0..height {
        for x in 0..width {
            let idx = ((y * width + x) * 3) as usize;
            data[idx] = base.wrapping_add((x % 256) as u8);
            data[idx + 1] = base.wrapping_add((y % 256) as u8);
            data[idx + 2] = base.wrapping_add(((x + y) % 256) as u8);
        }
    }
    Frame::new(data, width, height).with_sequence(frame_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        let frame = gradient_frame(16, 9, 3);
        assert!(frame.is_valid());
        assert_eq!(frame.sequence, 3);
        assert!(solid_frame(2, 2, 9).data.iter().all(|&b| b == 9));
    }

    #[test]
    fn test_gradient_changes_between_frames() {
        let a = gradient_frame(8, 8, 0);
        let b = gradient_frame(8, 8, 1);
        assert_ne!(a.data, b.data);
    }
}
