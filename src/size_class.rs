use std::sync::OnceLock;

use crate::{
    globals::{HEADER_SIZE, MAX_SZCLASS, PAGE_SIZE, SMALL_BYTE_ALIGNMENT},
    util::align_up,
};

/// Sizes up to this amount get a size class for each size step.
const PRECISE_CUTOFF: usize = 80;
const SIZE_STEP: usize = SMALL_BYTE_ALIGNMENT;
const PROGRESSION: f64 = 1.4;
/// Largest pool object including its header.
pub const LARGE_CUTOFF: usize = MAX_SZCLASS + HEADER_SIZE;
const PAGE_PAYLOAD: usize = PAGE_SIZE - SMALL_BYTE_ALIGNMENT;
pub const NUM_INDICES: usize = LARGE_CUTOFF / SIZE_STEP + 1;

fn generate_size_classes(progression: f64) -> Vec<usize> {
    let mut result = vec![];
    let mut add = |result: &mut Vec<usize>, size_class: usize| {
        log::trace!("Adding size class: {}", size_class);
        result.push(size_class);
    };

    let mut size = SIZE_STEP;
    while size < PRECISE_CUTOFF {
        add(&mut result, size);
        size += SIZE_STEP;
    }
    log::trace!("       Page payload size: {}", PAGE_PAYLOAD);

    for i in 0.. {
        let approximate_size = PRECISE_CUTOFF as f64 * progression.powi(i);
        let approximate_size_in_bytes = approximate_size as usize;
        if approximate_size_in_bytes >= LARGE_CUTOFF {
            break;
        }
        let size_class = align_up(approximate_size_in_bytes, SIZE_STEP);

        // Grow the class to the largest size that still fits the same number of cells.
        let cells_per_page = PAGE_PAYLOAD / size_class;
        let possibly_better = (PAGE_PAYLOAD / cells_per_page) & !(SIZE_STEP - 1);
        let original_wastage = PAGE_PAYLOAD - cells_per_page * size_class;
        let new_wastage = (possibly_better - size_class) * cells_per_page;
        log::trace!(
            "    Size class {}, possibly better {}, wastage {} vs {}",
            size_class,
            possibly_better,
            original_wastage,
            new_wastage
        );
        let better = if new_wastage > original_wastage {
            size_class
        } else {
            possibly_better
        };
        if Some(better) == result.last().copied() {
            continue;
        }
        if better >= LARGE_CUTOFF {
            break;
        }
        add(&mut result, better);
    }
    add(&mut result, LARGE_CUTOFF);
    result.sort_unstable();
    result.dedup();
    log::trace!("Heap size class dump: {:?}", result);
    result
}

pub struct SizeClasses {
    classes: Vec<usize>,
    /// Maps `size_to_index(size)` to the index of the smallest class holding `size`.
    table: Vec<u8>,
}

const fn size_to_index(size: usize) -> usize {
    (size + SIZE_STEP - 1) / SIZE_STEP
}

impl SizeClasses {
    fn build() -> Self {
        let classes = generate_size_classes(PROGRESSION);
        let mut table = vec![0u8; NUM_INDICES];
        let mut next_index = 0;
        for (class, &sz) in classes.iter().enumerate() {
            let index = size_to_index(sz);
            for slot in table.iter_mut().take(index + 1).skip(next_index) {
                *slot = class as u8;
            }
            next_index = index + 1;
        }
        Self { classes, table }
    }

    pub fn get() -> &'static SizeClasses {
        static CLASSES: OnceLock<SizeClasses> = OnceLock::new();
        CLASSES.get_or_init(SizeClasses::build)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn osize(&self, class: usize) -> usize {
        self.classes[class]
    }

    pub fn classes(&self) -> &[usize] {
        &self.classes
    }

    /// Pool index and cell size for an allocation of `allocsz` bytes, header included.
    /// `None` when the size needs the big object path.
    pub fn classify(&self, allocsz: usize) -> Option<(usize, usize)> {
        if allocsz > LARGE_CUTOFF {
            return None;
        }
        let class = self.table[size_to_index(allocsz)] as usize;
        Some((class, self.classes[class]))
    }
}

/// Shorthand for `SizeClasses::get().classify(allocsz)`.
pub fn classify_pools(allocsz: usize) -> Option<(usize, usize)> {
    SizeClasses::get().classify(allocsz)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes_cover_every_pool_size() {
        let classes = SizeClasses::get();
        assert!(classes.len() < 256);
        assert_eq!(classes.osize(0), SIZE_STEP);
        assert_eq!(*classes.classes().last().unwrap(), LARGE_CUTOFF);
        for sz in 1..=LARGE_CUTOFF {
            let (class, osize) = classes.classify(sz).unwrap();
            assert!(osize >= sz, "size {} got class of {}", sz, osize);
            if class > 0 {
                assert!(classes.osize(class - 1) < sz);
            }
        }
        assert!(classes.classify(LARGE_CUTOFF + 1).is_none());
    }

    #[test]
    fn test_classes_are_ascending() {
        let classes = SizeClasses::get().classes();
        for pair in classes.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0] % SIZE_STEP, 0);
        }
    }
}
