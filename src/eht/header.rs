use crate::eht::directory::Directory;

/// Top-level fan-out by the hash's most significant bits, selecting which
/// directory serves a key. Directories are created lazily on first
/// insert into their header slot and live for the container's lifetime.
pub struct Header<K, V> {
    max_depth: u32,
    directories: Vec<Option<Directory<K, V>>>,
}

impl<K, V> Header<K, V> {
    pub fn new(max_depth: u32) -> Self {
        let span = 1usize << max_depth;
        Self {
            max_depth,
            directories: (0..span).map(|_| None).collect(),
        }
    }

    pub fn hash_to_directory_index(&self, hash: u32) -> usize {
        if self.max_depth == 0 {
            return 0;
        }
        (hash >> (32 - self.max_depth)) as usize
    }

    pub fn directory(&self, index: usize) -> Option<&Directory<K, V>> {
        self.directories[index].as_ref()
    }

    pub fn directory_mut(&mut self, index: usize) -> Option<&mut Directory<K, V>> {
        self.directories[index].as_mut()
    }

    pub fn get_or_create_directory(
        &mut self,
        index: usize,
        dir_max_depth: u32,
        bucket_capacity: usize,
    ) -> &mut Directory<K, V> {
        self.directories[index]
            .get_or_insert_with(|| Directory::new(dir_max_depth, bucket_capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_index_uses_top_bits() {
        let header: Header<i32, i32> = Header::new(2);
        assert_eq!(header.hash_to_directory_index(0x0000_0000), 0);
        assert_eq!(header.hash_to_directory_index(0xC000_0000), 3);
        assert_eq!(header.hash_to_directory_index(0x4000_0000), 1);
    }

    #[test]
    fn lazy_creation() {
        let mut header: Header<i32, i32> = Header::new(2);
        assert!(header.directory(0).is_none());
        header.get_or_create_directory(0, 4, 4);
        assert!(header.directory(0).is_some());
    }
}
