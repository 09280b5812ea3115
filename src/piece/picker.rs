use rand::Rng;

/// Chooses the next piece a connection should download.
///
/// `wanted(i)` is true when piece `i` is missing locally, advertised by the
/// remote, and not already being assembled by the caller.
pub trait PiecePicker: Send {
    fn pick(&mut self, piece_count: usize, wanted: &dyn Fn(usize) -> bool) -> Option<usize>;
}

/// Scan forward from a fresh random offset, wrapping around, and take the
/// first wanted piece.
#[derive(Debug, Default)]
pub struct RandomPicker;

impl PiecePicker for RandomPicker {
    fn pick(&mut self, piece_count: usize, wanted: &dyn Fn(usize) -> bool) -> Option<usize> {
        if piece_count == 0 {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..piece_count);
        scan_from(start, piece_count, wanted)
    }
}

/// Always scan from piece 0.
#[derive(Debug, Default)]
pub struct SequentialPicker;

impl PiecePicker for SequentialPicker {
    fn pick(&mut self, piece_count: usize, wanted: &dyn Fn(usize) -> bool) -> Option<usize> {
        scan_from(0, piece_count, wanted)
    }
}

fn scan_from(start: usize, piece_count: usize, wanted: &dyn Fn(usize) -> bool) -> Option<usize> {
    (0..piece_count)
        .map(|step| (start + step) % piece_count)
        .find(|&index| wanted(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::Bitfield;

    #[test]
    fn test_sequential_picks_lowest_wanted() {
        let mut local = Bitfield::new(5);
        local.set(0);
        local.set(1);
        let mut picker = SequentialPicker;
        assert_eq!(picker.pick(5, &|i| !local.has(i)), Some(2));
    }

    #[test]
    fn test_random_only_returns_wanted_pieces() {
        let mut picker = RandomPicker;
        for _ in 0..100 {
            let picked = picker.pick(16, &|i| i == 3 || i == 11).unwrap();
            assert!(picked == 3 || picked == 11);
        }
    }

    #[test]
    fn test_nothing_wanted() {
        assert_eq!(RandomPicker.pick(8, &|_| false), None);
        assert_eq!(RandomPicker.pick(0, &|_| true), None);
        assert_eq!(SequentialPicker.pick(0, &|_| true), None);
    }

    #[test]
    fn test_wraps_around() {
        assert_eq!(scan_from(6, 8, &|i| i == 1), Some(1));
    }
}
