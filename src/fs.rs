//! Filesystem façade tying the codec, path algebra, allocation bitmap, and
//! chunk-chain layer together over a backing store.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------+
//! |      Filesystem<S>       |  <- This module
//! |  +--------------------+  |
//! |  | directory store    |  |  (resolution, recursive saves)
//! |  +---------+----------+  |
//! |            |             |
//! |  +---------v----------+  |
//! |  | chunk-chain layer  |  |  (walk, growth, per-chunk RMW)
//! |  +---------+----------+  |
//! |            |             |
//! |  +---------v----------+  |
//! |  | allocation bitmap  |  |  (find free, mark used)
//! |  +---------+----------+  |
//! +------------+-------------+
//!              |
//! +------------v-------------+
//! |      BackingStore        |  (file, memory, device)
//! +--------------------------+
//! ```
//!
//! The filesystem is single-writer: every public operation runs to
//! completion before the next begins, and a multi-threaded embedder must
//! serialize calls behind its own lock. Two write-through caches (chunk
//! lists per normalized path, decoded directories per body offset) are
//! invalidated eagerly before any mutation that could stale them.

use std::num::NonZeroUsize;

use log::{debug, error, info, warn};
use lru::LruCache;

use crate::bitmap::BlockBitmap;
use crate::bitstream::{BitBuffer, BitReader, BitWriter};
use crate::error::{FsError, Result};
use crate::format::{
    ChunkHeader, DirectoryDescriptor, FileDescriptor, Layout, PartitionHeader,
    CHUNK_HEADER_SIZE, DIR_PROLOGUE_SIZE, HEADER_MAX_SIZE,
};
use crate::path::{split_first, FsPath, SEPARATOR};
use crate::store::BackingStore;

/// Bound on the per-path chunk list cache.
const CHUNK_CACHE_CAPACITY: usize = 64;

/// Bound on the decoded directory cache.
const DIR_CACHE_CAPACITY: usize = 64;

/// A block-structured filesystem inside a fixed-size partition.
pub struct Filesystem<S: BackingStore> {
    store: S,
    layout: Layout,

    /// In-memory root directory, persisted inside the partition header.
    root: DirectoryDescriptor,

    /// Chunk lists keyed by normalized path.
    chunk_cache: LruCache<String, Vec<ChunkHeader>>,

    /// Decoded directories keyed by body offset.
    dir_cache: LruCache<u64, DirectoryDescriptor>,
}

impl<S: BackingStore> Filesystem<S> {
    /// Mounts the partition, loading the header or formatting a fresh
    /// filesystem when no valid header is present.
    pub fn mount(store: S, partition_size: u64, block_size: u64) -> Result<Self> {
        let layout = Layout::new(partition_size, block_size)?;
        let store_size = store.size()?;
        if store_size < partition_size {
            return Err(FsError::InvalidGeometry(format!(
                "backing store holds {store_size} bytes, partition needs {partition_size}"
            )));
        }

        let mut fs = Self {
            store,
            layout,
            root: DirectoryDescriptor::root(),
            chunk_cache: LruCache::new(
                NonZeroUsize::new(CHUNK_CACHE_CAPACITY).expect("cache capacity is nonzero"),
            ),
            dir_cache: LruCache::new(
                NonZeroUsize::new(DIR_CACHE_CAPACITY).expect("cache capacity is nonzero"),
            ),
        };
        fs.initialize()?;
        Ok(fs)
    }

    /// Loads the header, or creates one (clearing the bitmap) when the
    /// magic number does not match.
    pub fn initialize(&mut self) -> Result<()> {
        debug!("loading or creating the filesystem header");

        self.chunk_cache.clear();
        self.dir_cache.clear();

        let mut bytes = vec![0u8; HEADER_MAX_SIZE as usize];
        self.store.read_at(0, &mut bytes)?;
        let buffer = BitBuffer::from_bytes(bytes);
        let mut reader = BitReader::new(&buffer);

        match PartitionHeader::decode(&mut reader)? {
            Some(header) => {
                info!(
                    "mounted existing filesystem ({} root entries)",
                    header.root.entries.len()
                );
                self.root = header.root;
            }
            None => {
                info!(
                    "formatting fresh filesystem on a {} partition",
                    format_bytes(self.layout.partition_size())
                );
                self.clear_bitmap()?;
                self.root = DirectoryDescriptor::root();
                self.save_header()?;
            }
        }
        Ok(())
    }

    pub fn partition_size(&self) -> u64 {
        self.layout.partition_size()
    }

    pub fn block_size(&self) -> u64 {
        self.layout.block_size()
    }

    /// Flushes the backing store.
    pub fn flush(&mut self) -> Result<()> {
        Ok(self.store.flush()?)
    }

    /// Unmounts, handing the partition back to the caller.
    pub fn into_store(self) -> S {
        self.store
    }

    // ========================================================================
    // Header
    // ========================================================================

    fn save_header(&mut self) -> Result<()> {
        let header = PartitionHeader::new(self.root.clone());
        let mut buffer = BitBuffer::new();
        header.encode(&mut BitWriter::new(&mut buffer));

        if buffer.byte_len() as u64 > HEADER_MAX_SIZE {
            error!("root directory no longer fits the header region");
            return Err(FsError::OversizedDirectory {
                size: buffer.byte_len() as u64,
                max: HEADER_MAX_SIZE,
            });
        }

        self.store.write_at(0, buffer.as_bytes())?;
        debug!("filesystem header written ({} bytes)", buffer.byte_len());
        Ok(())
    }

    // ========================================================================
    // Allocation bitmap
    // ========================================================================

    fn read_bitmap(&mut self) -> Result<BlockBitmap> {
        let mut bytes = vec![0u8; self.layout.bitmap_bytes() as usize];
        self.store.read_at(self.layout.bitmap_offset(), &mut bytes)?;
        Ok(BlockBitmap::from_bytes(bytes, self.layout.bitmap_bits()))
    }

    /// One write covers the whole region, so the update is atomic from the
    /// filesystem's own perspective.
    fn write_bitmap(&mut self, bitmap: &BlockBitmap) -> Result<()> {
        Ok(self
            .store
            .write_at(self.layout.bitmap_offset(), bitmap.as_bytes())?)
    }

    fn clear_bitmap(&mut self) -> Result<()> {
        let zeros = vec![0u8; self.layout.bitmap_bytes() as usize];
        self.store.write_at(self.layout.bitmap_offset(), &zeros)?;
        debug!("allocation bitmap cleared");
        Ok(())
    }

    /// Finds `count` free blocks in ascending order, never touching the
    /// reserved indices below the content region.
    fn find_free_blocks(&mut self, count: u64) -> Result<Vec<u64>> {
        let bitmap = self.read_bitmap()?;
        let first = self.layout.first_content_block();
        bitmap.find_free(first, count).ok_or_else(|| {
            let available = bitmap.count_free_from(first);
            error!("needed {count} free blocks, only {available} available");
            FsError::OutOfSpace {
                requested: count,
                available,
            }
        })
    }

    fn set_blocks_in_use(&mut self, blocks: &[u64], in_use: bool) -> Result<()> {
        debug_assert!(!blocks.is_empty());
        let mut bitmap = self.read_bitmap()?;
        for &block in blocks {
            if bitmap.is_set(block) == in_use {
                warn!(
                    "block {block} is already {}",
                    if in_use { "in use" } else { "free" }
                );
                continue;
            }
            bitmap.set(block, in_use);
        }
        self.write_bitmap(&bitmap)
    }

    /// Number of blocks currently marked in use.
    pub fn used_block_count(&mut self) -> Result<u64> {
        Ok(self.read_bitmap()?.count_used())
    }

    /// Partition size and the bytes still allocatable in the content
    /// region.
    pub fn total_and_free_bytes(&mut self) -> Result<(u64, u64)> {
        let bitmap = self.read_bitmap()?;
        let free_blocks = bitmap.count_free_from(self.layout.first_content_block());
        Ok((
            self.layout.partition_size(),
            free_blocks * self.layout.block_size(),
        ))
    }

    // ========================================================================
    // Chunk chains
    // ========================================================================

    fn read_chunk_header(&mut self, offset: u64) -> Result<ChunkHeader> {
        let mut bytes = vec![0u8; CHUNK_HEADER_SIZE as usize];
        self.store.read_at(offset, &mut bytes)?;
        let buffer = BitBuffer::from_bytes(bytes);
        Ok(ChunkHeader::decode(&mut BitReader::new(&buffer))?)
    }

    fn write_chunk_header(&mut self, offset: u64, header: &ChunkHeader) -> Result<()> {
        let mut buffer = BitBuffer::new();
        header.encode(&mut BitWriter::new(&mut buffer));
        Ok(self.store.write_at(offset, buffer.as_bytes())?)
    }

    /// Walks the chain of chunk headers starting at an absolute offset.
    /// An offset of 0 is the empty chain.
    fn walk_chunk_chain(&mut self, first_chunk_offset: u64) -> Result<Vec<ChunkHeader>> {
        let mut chunks = Vec::new();
        if first_chunk_offset == 0 {
            return Ok(chunks);
        }

        let mut offset = first_chunk_offset;
        loop {
            let header = self.read_chunk_header(offset)?;
            chunks.push(header);
            if header.next_block_index == 0 {
                break;
            }
            if chunks.len() as u64 > self.layout.bitmap_bits() {
                return Err(FsError::InvariantViolation(
                    "chunk chain is longer than the partition has blocks".to_string(),
                ));
            }
            offset = self.layout.block_offset(header.next_block_index);
        }
        Ok(chunks)
    }

    /// Cached chain lookup by normalized path.
    fn chunk_chain_for(&mut self, path: &FsPath, file: &FileDescriptor) -> Result<Vec<ChunkHeader>> {
        if let Some(chunks) = self.chunk_cache.get(path.as_str()) {
            return Ok(chunks.clone());
        }
        let chunks = self.walk_chunk_chain(file.first_chunk_offset)?;
        self.chunk_cache.put(path.as_str().to_string(), chunks.clone());
        Ok(chunks)
    }

    /// The start block plus every link target of a chain, for freeing.
    fn chain_blocks(&self, first_chunk_offset: u64, chunks: &[ChunkHeader]) -> Vec<u64> {
        let mut blocks = vec![self.layout.block_index(first_chunk_offset)];
        blocks.extend(
            chunks
                .iter()
                .filter(|chunk| chunk.next_block_index != 0)
                .map(|chunk| chunk.next_block_index),
        );
        blocks
    }

    // ========================================================================
    // Directory store
    // ========================================================================

    /// Decodes the directory body at a file descriptor's chunk offset.
    fn read_directory(&mut self, file: &FileDescriptor) -> Result<DirectoryDescriptor> {
        debug_assert!(file.is_directory);
        if let Some(directory) = self.dir_cache.get(&file.first_chunk_offset) {
            return Ok(directory.clone());
        }

        let mut prologue = vec![0u8; DIR_PROLOGUE_SIZE as usize];
        self.store.read_at(file.first_chunk_offset, &mut prologue)?;
        let buffer = BitBuffer::from_bytes(prologue);
        let mut reader = BitReader::new(&buffer);
        let _chunk = ChunkHeader::decode(&mut reader)?;
        let content_length = reader.read_u64()?;

        if content_length == 0 {
            // Freshly allocated body that has never been saved.
            return Ok(DirectoryDescriptor::default());
        }
        if content_length > self.layout.block_size() - DIR_PROLOGUE_SIZE {
            return Err(FsError::InvariantViolation(format!(
                "directory body at offset {} claims {content_length} bytes, more than a block holds",
                file.first_chunk_offset
            )));
        }

        let mut content = vec![0u8; content_length as usize];
        self.store
            .read_at(file.first_chunk_offset + DIR_PROLOGUE_SIZE, &mut content)?;
        let buffer = BitBuffer::from_bytes(content);
        let directory = DirectoryDescriptor::decode(&mut BitReader::new(&buffer))?;

        self.dir_cache.put(file.first_chunk_offset, directory.clone());
        Ok(directory)
    }

    /// Persists a directory body at its offset.
    ///
    /// The root routes through a header rewrite instead; its `offset`
    /// argument (always 0) is ignored.
    fn save_directory(&mut self, directory: &DirectoryDescriptor, offset: u64) -> Result<()> {
        if directory.is_root {
            debug!("saving root directory through the partition header");
            self.root = directory.clone();
            return self.save_header();
        }

        let mut buffer = BitBuffer::new();
        let mut writer = BitWriter::new(&mut buffer);
        ChunkHeader {
            next_block_index: 0,
            block_count: 1,
        }
        .encode(&mut writer);
        writer.write_u64(0); // content length, patched once the body is known
        directory.encode(&mut writer);

        let content_length = buffer.byte_len() as u64 - DIR_PROLOGUE_SIZE;
        buffer.patch_u64(CHUNK_HEADER_SIZE as usize, content_length);

        if buffer.byte_len() as u64 > self.layout.block_size() {
            error!(
                "directory body of {} bytes does not fit a {} byte block",
                buffer.byte_len(),
                self.layout.block_size()
            );
            return Err(FsError::OversizedDirectory {
                size: buffer.byte_len() as u64,
                max: self.layout.block_size(),
            });
        }

        self.store.write_at(offset, buffer.as_bytes())?;
        self.dir_cache.put(offset, directory.clone());
        Ok(())
    }

    /// Resolves a normalized path to its directory descriptor plus the
    /// descriptor entry naming it (`None` for the root, which has no
    /// entry).
    fn locate_directory(
        &mut self,
        path: &FsPath,
    ) -> Result<(DirectoryDescriptor, Option<FileDescriptor>)> {
        if path.is_empty() {
            debug_assert!(self.root.is_root);
            return Ok((self.root.clone(), None));
        }
        let root = self.root.clone();
        self.locate_directory_in(path.as_str(), &root, path)
    }

    fn locate_directory_in(
        &mut self,
        remaining: &str,
        current: &DirectoryDescriptor,
        full: &FsPath,
    ) -> Result<(DirectoryDescriptor, Option<FileDescriptor>)> {
        let (first, rest) = split_first(remaining);
        let is_terminal = !remaining.contains(SEPARATOR);

        let mut file_with_name = false;
        for entry in &current.entries {
            if entry.name != first {
                continue;
            }
            if !entry.is_directory {
                file_with_name = true;
                continue;
            }

            let next = self.read_directory(entry)?;
            return if is_terminal {
                Ok((next, Some(entry.clone())))
            } else {
                self.locate_directory_in(rest, &next, full)
            };
        }

        if file_with_name {
            Err(FsError::NotADirectory(full.to_string()))
        } else {
            Err(FsError::NotFound(full.to_string()))
        }
    }

    /// Resolves a normalized path to `(parent directory, parent's own
    /// descriptor entry, file descriptor)`.
    fn locate_file(
        &mut self,
        path: &FsPath,
    ) -> Result<(DirectoryDescriptor, Option<FileDescriptor>, FileDescriptor)> {
        if path.is_empty() {
            return Err(FsError::IsADirectory("/".to_string()));
        }

        let (parent, parent_file) = self.locate_directory(&path.parent())?;
        let leaf = path.leaf();

        if let Some(file) = parent
            .entries
            .iter()
            .find(|e| !e.is_directory && e.name == leaf)
            .cloned()
        {
            Ok((parent, parent_file, file))
        } else if parent.entries.iter().any(|e| e.is_directory && e.name == leaf) {
            Err(FsError::IsADirectory(path.to_string()))
        } else {
            Err(FsError::NotFound(path.to_string()))
        }
    }

    // ========================================================================
    // Public namespace operations
    // ========================================================================

    /// Resolves a directory descriptor. The empty path (and `/`) name the
    /// root.
    pub fn get_directory(&mut self, path: &str) -> Result<DirectoryDescriptor> {
        let path = FsPath::normalize(path);
        debug!("resolving directory {path}");
        Ok(self.locate_directory(&path)?.0)
    }

    pub fn directory_exists(&mut self, path: &str) -> bool {
        self.get_directory(path).is_ok()
    }

    pub fn get_file(&mut self, path: &str) -> Result<FileDescriptor> {
        let path = FsPath::normalize(path);
        self.locate_file(&path).map(|(_, _, file)| file)
    }

    pub fn file_exists(&mut self, path: &str) -> bool {
        self.get_file(path).is_ok()
    }

    pub fn get_file_size(&mut self, path: &str) -> Result<u64> {
        Ok(self.get_file(path)?.size)
    }

    pub fn is_directory_empty(&mut self, path: &str) -> Result<bool> {
        Ok(self.get_directory(path)?.entries.is_empty())
    }

    /// Creates an empty file. Every directory on the way must already
    /// exist; no blocks are allocated until the first write.
    pub fn create_file(&mut self, path: &str) -> Result<()> {
        let path = FsPath::normalize(path);
        if path.is_empty() {
            return Err(FsError::IsADirectory("/".to_string()));
        }
        debug!("creating file {path}");

        let mut root = std::mem::take(&mut self.root);
        let mut needs_resave = false;
        let result = self.create_file_in(path.as_str(), &mut root, &mut needs_resave, &path);
        self.root = root;
        result?;

        if needs_resave {
            // The root lives in the header, so a root-level change means
            // rewriting the header itself.
            self.save_header()?;
        }
        Ok(())
    }

    fn create_file_in(
        &mut self,
        remaining: &str,
        current: &mut DirectoryDescriptor,
        needs_resave: &mut bool,
        full: &FsPath,
    ) -> Result<()> {
        let (first, rest) = split_first(remaining);
        let is_terminal = !remaining.contains(SEPARATOR);

        if is_terminal {
            if current.entries.iter().any(|e| e.name == first) {
                debug!("{full} already exists");
                return Err(FsError::AlreadyExists(full.to_string()));
            }
            current.entries.push(FileDescriptor {
                name: first.to_string(),
                size: 0,
                first_chunk_offset: 0, // blocks are allocated on first write
                is_directory: false,
            });
            *needs_resave = true;
            return Ok(());
        }

        let Some(entry) = current
            .entries
            .iter()
            .find(|e| e.is_directory && e.name == first)
            .cloned()
        else {
            return Err(FsError::NotFound(full.to_string()));
        };

        let mut next = self.read_directory(&entry)?;
        let mut child_resave = false;
        self.create_file_in(rest, &mut next, &mut child_resave, full)?;
        if child_resave {
            self.save_directory(&next, entry.first_chunk_offset)?;
        }
        Ok(())
    }

    /// Creates a directory, recursively creating missing components.
    pub fn create_directory(&mut self, path: &str) -> Result<()> {
        let path = FsPath::normalize(path);
        if path.is_empty() {
            return Err(FsError::AlreadyExists("/".to_string()));
        }
        debug!("creating directory {path}");

        let mut root = std::mem::take(&mut self.root);
        let mut needs_resave = false;
        let result = self.create_directory_in(path.as_str(), &mut root, &mut needs_resave, &path);
        self.root = root;
        result?;

        if needs_resave {
            self.save_header()?;
        }
        Ok(())
    }

    fn create_directory_in(
        &mut self,
        remaining: &str,
        current: &mut DirectoryDescriptor,
        needs_resave: &mut bool,
        full: &FsPath,
    ) -> Result<()> {
        let (first, rest) = split_first(remaining);
        let is_terminal = !remaining.contains(SEPARATOR);

        if let Some(entry) = current
            .entries
            .iter()
            .find(|e| e.is_directory && e.name == first)
            .cloned()
        {
            if is_terminal {
                debug!("directory {full} already exists");
                return Err(FsError::AlreadyExists(full.to_string()));
            }

            let mut next = self.read_directory(&entry)?;
            let mut child_resave = false;
            self.create_directory_in(rest, &mut next, &mut child_resave, full)?;
            if child_resave {
                // Only directories the recursion actually modified are
                // rewritten; this level's own entry list is untouched.
                self.save_directory(&next, entry.first_chunk_offset)?;
            }
            return Ok(());
        }

        // Build the missing tail bottom-up so the new body is complete
        // before it is persisted.
        let mut new_directory = DirectoryDescriptor::default();
        if !is_terminal {
            let mut ignored = false;
            self.create_directory_in(rest, &mut new_directory, &mut ignored, full)?;
        }

        let blocks = self.find_free_blocks(1)?;
        self.set_blocks_in_use(&blocks, true)?;
        let offset = self.layout.block_offset(blocks[0]);
        self.save_directory(&new_directory, offset)?;

        current.entries.push(FileDescriptor {
            name: first.to_string(),
            size: 0,
            first_chunk_offset: offset,
            is_directory: true,
        });
        *needs_resave = true;
        Ok(())
    }

    /// Deletes an empty directory and frees its body blocks.
    pub fn delete_directory(&mut self, path: &str) -> Result<()> {
        let path = FsPath::normalize(path);
        let (target_directory, _) = self.locate_directory(&path)?;
        if !target_directory.entries.is_empty() {
            error!("cannot delete non-empty directory {path}");
            return Err(FsError::NotEmpty(path.to_string()));
        }

        let (mut parent, parent_file) = self.locate_directory(&path.parent())?;
        let leaf = path.leaf();
        let index = parent
            .entries
            .iter()
            .position(|e| e.name == leaf)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if !parent.entries[index].is_directory {
            return Err(FsError::NotADirectory(path.to_string()));
        }

        let target = parent.entries[index].clone();
        let chunks = self.walk_chunk_chain(target.first_chunk_offset)?;
        if !chunks.is_empty() {
            let blocks = self.chain_blocks(target.first_chunk_offset, &chunks);
            self.set_blocks_in_use(&blocks, false)?;
        }

        parent.entries.remove(index);
        let parent_offset = directory_offset(&parent_file);
        self.save_directory(&parent, parent_offset)?;

        self.chunk_cache.pop(path.as_str());
        self.dir_cache.pop(&target.first_chunk_offset);
        info!("deleted directory {path}");
        Ok(())
    }

    /// Moves or renames a file. Only the descriptor moves between the
    /// parent directories; the chunk chain stays where it is.
    pub fn move_file(&mut self, source: &str, destination: &str) -> Result<()> {
        let source_path = FsPath::normalize(source);
        let destination_path = FsPath::normalize(destination);
        if source_path.is_empty() || destination_path.is_empty() {
            return Err(FsError::NotFound(source_path.to_string()));
        }

        let source_parent = source_path.parent();
        let destination_parent = destination_path.parent();
        let source_leaf = source_path.leaf().to_string();
        let destination_leaf = destination_path.leaf().to_string();

        let (mut destination_dir, destination_dir_file) =
            self.locate_directory(&destination_parent)?;

        if source_parent == destination_parent {
            // Same-directory fast path: one lookup, one save.
            let index = destination_dir
                .entries
                .iter()
                .position(|e| e.name == source_leaf)
                .ok_or_else(|| FsError::NotFound(source_path.to_string()))?;
            if destination_dir
                .entries
                .iter()
                .any(|e| e.name == destination_leaf)
            {
                return Err(FsError::AlreadyExists(destination_path.to_string()));
            }

            let mut moved = destination_dir.entries.remove(index);
            moved.name = destination_leaf;
            destination_dir.entries.push(moved);

            let offset = directory_offset(&destination_dir_file);
            self.save_directory(&destination_dir, offset)?;
        } else {
            let (mut source_dir, source_dir_file) = self.locate_directory(&source_parent)?;
            let index = source_dir
                .entries
                .iter()
                .position(|e| e.name == source_leaf)
                .ok_or_else(|| FsError::NotFound(source_path.to_string()))?;
            if destination_dir
                .entries
                .iter()
                .any(|e| e.name == destination_leaf)
            {
                return Err(FsError::AlreadyExists(destination_path.to_string()));
            }

            let mut moved = source_dir.entries.remove(index);
            moved.name = destination_leaf;
            destination_dir.entries.push(moved);

            self.save_directory(&destination_dir, directory_offset(&destination_dir_file))?;
            self.save_directory(&source_dir, directory_offset(&source_dir_file))?;
        }

        self.chunk_cache.pop(source_path.as_str());
        self.chunk_cache.pop(destination_path.as_str());
        info!("moved {source_path} to {destination_path}");
        Ok(())
    }

    // ========================================================================
    // File I/O
    // ========================================================================

    /// Writes `src` at `offset`, growing the file as needed.
    pub fn write(&mut self, path: &str, src: &[u8], offset: u64) -> Result<()> {
        self.write_impl(path, Some(src), offset, src.len() as u64)
    }

    /// Grows the file so `size` bytes are allocated and addressable
    /// without writing any content. Bytes in the newly covered range are
    /// *not* zeroed; they read back as whatever the partition held.
    /// Shrinking is not supported; a `size` at or below the current file
    /// size leaves it unchanged.
    pub fn set_end_of_file(&mut self, path: &str, size: u64) -> Result<()> {
        self.write_impl(path, None, 0, size)
    }

    fn write_impl(&mut self, path: &str, src: Option<&[u8]>, offset: u64, len: u64) -> Result<()> {
        let path = FsPath::normalize(path);
        let layout = self.layout;
        let (mut parent, parent_file, mut file) = self.locate_file(&path)?;

        // The chain is about to change shape; drop the cached copy first.
        self.chunk_cache.pop(path.as_str());
        let mut chunks = self.walk_chunk_chain(file.first_chunk_offset)?;

        let max_write = offset.checked_add(len).ok_or_else(|| {
            FsError::InvariantViolation(format!("write range {offset}+{len} overflows"))
        })?;

        let content_per_block = layout.content_per_block();
        let allocated_content = chunks.len() as u64 * content_per_block;
        if max_write > allocated_content {
            let extra = max_write - allocated_content;
            let mut needed = extra.div_ceil(layout.block_size());
            // Conservative bound: count only the content bytes each block
            // carries once its chunk header is paid for.
            while needed * content_per_block < max_write {
                needed += 1;
            }

            let new_blocks = self.find_free_blocks(needed)?;
            self.set_blocks_in_use(&new_blocks, true)?;
            debug!("allocating {needed} blocks for {path}");

            if chunks.is_empty() {
                file.first_chunk_offset = layout.block_offset(new_blocks[0]);
            } else {
                // Link the existing tail to the first new block and write
                // that header back.
                let last_index = chunks.len() - 1;
                chunks[last_index].next_block_index = new_blocks[0];
                let last_offset = if last_index > 0 {
                    layout.block_offset(chunks[last_index - 1].next_block_index)
                } else {
                    file.first_chunk_offset
                };
                let updated = chunks[last_index];
                self.write_chunk_header(last_offset, &updated)?;
            }

            // Persist every new chunk header now: the content pass below
            // may skip chunks that precede the write offset, and the
            // parent directory must never point at a chain with unwritten
            // links.
            for (i, &block) in new_blocks.iter().enumerate() {
                let header = ChunkHeader {
                    next_block_index: if i + 1 < new_blocks.len() {
                        new_blocks[i + 1]
                    } else {
                        0
                    },
                    block_count: 1,
                };
                self.write_chunk_header(layout.block_offset(block), &header)?;
                chunks.push(header);
            }
        }

        if max_write > file.size {
            file.size = max_write;
        }

        // Read-modify-write every chunk overlapping the window.
        let mut cursor: u64 = 0;
        let mut chunk_offset = file.first_chunk_offset;
        for chunk in &chunks {
            let chunk_size = chunk.block_count * layout.block_size();
            let content_len = chunk_size - CHUNK_HEADER_SIZE;
            let chunk_start = cursor;
            let chunk_end = cursor + content_len;

            if chunk_end <= offset {
                cursor = chunk_end;
                if chunk.next_block_index == 0 {
                    break;
                }
                chunk_offset = layout.block_offset(chunk.next_block_index);
                continue;
            }

            match src {
                None => {
                    // Growth only: refresh the header, leave content as-is.
                    self.write_chunk_header(chunk_offset, chunk)?;
                }
                Some(data) => {
                    let mut block = vec![0u8; chunk_size as usize];
                    self.store.read_at(chunk_offset, &mut block)?;

                    let mut header_buffer = BitBuffer::new();
                    chunk.encode(&mut BitWriter::new(&mut header_buffer));
                    block[..CHUNK_HEADER_SIZE as usize].copy_from_slice(header_buffer.as_bytes());

                    let copy_start = offset.max(chunk_start);
                    let copy_end = max_write.min(chunk_end);
                    if copy_end > copy_start {
                        let in_chunk = (CHUNK_HEADER_SIZE + (copy_start - chunk_start)) as usize;
                        let src_start = (copy_start - offset) as usize;
                        let count = (copy_end - copy_start) as usize;
                        block[in_chunk..in_chunk + count]
                            .copy_from_slice(&data[src_start..src_start + count]);
                    }

                    self.store.write_at(chunk_offset, &block)?;
                }
            }

            cursor = chunk_end;
            if cursor >= max_write || chunk.next_block_index == 0 {
                break;
            }
            chunk_offset = layout.block_offset(chunk.next_block_index);
        }

        // Persist the descriptor (size and first chunk) through the parent.
        let leaf = path.leaf();
        let entry = parent
            .entries
            .iter_mut()
            .find(|e| !e.is_directory && e.name == leaf)
            .ok_or_else(|| {
                FsError::InvariantViolation(format!("descriptor for {path} vanished during write"))
            })?;
        *entry = file.clone();
        let parent_offset = directory_offset(&parent_file);
        self.save_directory(&parent, parent_offset)?;

        info!(
            "wrote {len} bytes at offset {offset} to {path} ({} chunks)",
            chunks.len()
        );

        // The chain on disk must round-trip to what was just linked.
        let reloaded = self.walk_chunk_chain(file.first_chunk_offset)?;
        if reloaded.len() != chunks.len() {
            return Err(FsError::InvariantViolation(format!(
                "chunk chain for {path} has {} links on disk, expected {}",
                reloaded.len(),
                chunks.len()
            )));
        }
        self.chunk_cache.put(path.as_str().to_string(), chunks);

        if let Some(data) = src {
            self.validate_write(&path, data, offset, len)?;
        }
        Ok(())
    }

    /// Reads up to `dst.len()` bytes at `offset`, clamped to the file
    /// size. Returns the number of bytes read.
    pub fn read(&mut self, path: &str, offset: u64, dst: &mut [u8]) -> Result<u64> {
        let path = FsPath::normalize(path);
        let layout = self.layout;
        let (_, _, file) = self.locate_file(&path)?;

        let mut len = dst.len() as u64;
        let end = offset.checked_add(len);
        if end.is_none() || end.is_some_and(|e| e > file.size) {
            len = file
                .size
                .checked_sub(offset)
                .ok_or(FsError::OutOfBounds {
                    offset,
                    size: file.size,
                })?;
        }
        if len == 0 {
            return Ok(0);
        }

        let chunks = self.chunk_chain_for(&path, &file)?;
        if chunks.is_empty() {
            return Err(FsError::InvariantViolation(format!(
                "{path} reports {} bytes but owns no chunks",
                file.size
            )));
        }

        let max_read = offset + len;
        let mut bytes_read: u64 = 0;
        let mut cursor: u64 = 0;
        let mut chunk_offset = file.first_chunk_offset;
        for chunk in &chunks {
            let chunk_size = chunk.block_count * layout.block_size();
            let content_len = chunk_size - CHUNK_HEADER_SIZE;
            let chunk_start = cursor;
            let chunk_end = cursor + content_len;

            if chunk_end <= offset {
                cursor = chunk_end;
                if chunk.next_block_index == 0 {
                    break;
                }
                chunk_offset = layout.block_offset(chunk.next_block_index);
                continue;
            }

            let mut block = vec![0u8; chunk_size as usize];
            self.store.read_at(chunk_offset, &mut block)?;

            let copy_start = offset.max(chunk_start);
            let copy_end = max_read.min(chunk_end);
            if copy_end > copy_start {
                let in_chunk = (CHUNK_HEADER_SIZE + (copy_start - chunk_start)) as usize;
                let dst_start = (copy_start - offset) as usize;
                let count = (copy_end - copy_start) as usize;
                dst[dst_start..dst_start + count]
                    .copy_from_slice(&block[in_chunk..in_chunk + count]);
                bytes_read += count as u64;
            }

            cursor = chunk_end;
            if cursor >= max_read || chunk.next_block_index == 0 {
                break;
            }
            chunk_offset = layout.block_offset(chunk.next_block_index);
        }

        if bytes_read != len {
            return Err(FsError::InvariantViolation(format!(
                "short read on {path}: {bytes_read} of {len} bytes"
            )));
        }
        Ok(bytes_read)
    }

    /// Deletes a file and frees every block of its chain.
    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        let path = FsPath::normalize(path);
        let (mut parent, parent_file, file) = self.locate_file(&path)?;

        let chunks = self.chunk_chain_for(&path, &file)?;
        if !chunks.is_empty() {
            let blocks = self.chain_blocks(file.first_chunk_offset, &chunks);
            self.set_blocks_in_use(&blocks, false)?;
        }

        let leaf = path.leaf();
        let index = parent
            .entries
            .iter()
            .position(|e| !e.is_directory && e.name == leaf)
            .ok_or_else(|| {
                FsError::InvariantViolation(format!("entry for {path} vanished during delete"))
            })?;
        parent.entries.remove(index);

        let parent_offset = directory_offset(&parent_file);
        self.save_directory(&parent, parent_offset)?;

        self.chunk_cache.pop(path.as_str());
        info!("deleted file {path}");
        Ok(())
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Logs the whole directory tree depth-first through the `log` facade.
    pub fn log_tree(&mut self) {
        let root = self.root.clone();
        if let Err(err) = self.log_tree_level(&root, 0) {
            error!("failed to walk the directory tree: {err}");
        }
    }

    fn log_tree_level(&mut self, directory: &DirectoryDescriptor, depth: usize) -> Result<()> {
        for entry in &directory.entries {
            let mut line = String::new();
            if depth > 0 {
                for _ in 0..depth {
                    line.push_str("  ");
                }
                line.push_str("|--");
            }
            line.push_str(&entry.name);

            if entry.is_directory {
                info!("{line}");
                let sub = self.read_directory(entry)?;
                self.log_tree_level(&sub, depth + 1)?;
            } else {
                info!("{line} ({})", format_bytes(entry.size));
            }
        }
        Ok(())
    }

    /// Reads the written range back and compares it byte-for-byte.
    /// A mismatch means the chunk math is broken, not that the caller
    /// did anything wrong.
    fn validate_write(&mut self, path: &FsPath, data: &[u8], offset: u64, len: u64) -> Result<()> {
        let mut readback = vec![0u8; len as usize];
        let bytes_read = self.read(path.as_str(), offset, &mut readback)?;
        if bytes_read != len {
            return Err(FsError::InvariantViolation(format!(
                "write validation on {path} read {bytes_read} of {len} bytes"
            )));
        }
        if let Some(index) = (0..len as usize).find(|&i| readback[i] != data[i]) {
            return Err(FsError::InvariantViolation(format!(
                "write validation on {path} found a mismatch at byte {index}"
            )));
        }
        debug!("validated write of {len} bytes on {path}");
        Ok(())
    }
}

/// Body offset of a located directory; the root has no entry and saves
/// through the header, so its offset is never dereferenced.
fn directory_offset(directory_file: &Option<FileDescriptor>) -> u64 {
    directory_file
        .as_ref()
        .map(|file| file.first_chunk_offset)
        .unwrap_or(0)
}

/// Formats a byte count as a short human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes < KIB {
        format!("{bytes}B")
    } else if bytes < MIB {
        format!("{}.{:02}KB", bytes / KIB, (bytes % KIB) * 100 / KIB)
    } else if bytes < GIB {
        format!("{}.{:02}MB", bytes / MIB, (bytes % MIB) * 100 / MIB)
    } else {
        format!("{}.{:02}GB", bytes / GIB, (bytes % GIB) * 100 / GIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    const MIB: usize = 1024 * 1024;

    fn test_fs(partition_size: usize) -> Filesystem<MemoryBackend> {
        Filesystem::mount(
            MemoryBackend::new(partition_size),
            partition_size as u64,
            1024,
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_mount_is_empty() {
        let mut fs = test_fs(MIB);

        assert!(fs.get_directory("").unwrap().entries.is_empty());
        assert!(fs.get_directory("/").unwrap().entries.is_empty());
        assert_eq!(fs.used_block_count().unwrap(), 0);

        let (total, free) = fs.total_and_free_bytes().unwrap();
        assert_eq!(total, MIB as u64);
        assert_eq!(free, 1015 * 1024); // 1020 bitmap bits, first 5 reserved
    }

    #[test]
    fn test_create_directory_nested() {
        let mut fs = test_fs(MIB);
        fs.create_directory("a/b/c").unwrap();

        assert!(fs.directory_exists("a"));
        assert!(fs.directory_exists("a/b"));
        assert!(fs.directory_exists("a/b/c"));
        assert!(!fs.directory_exists("a/c"));
        assert_eq!(fs.used_block_count().unwrap(), 3);
    }

    #[test]
    fn test_create_directory_already_exists() {
        let mut fs = test_fs(MIB);
        fs.create_directory("a/b").unwrap();

        assert!(matches!(
            fs.create_directory("a/b"),
            Err(FsError::AlreadyExists(_))
        ));
        // Creating a deeper path under an existing prefix still works.
        fs.create_directory("a/b/c").unwrap();
    }

    #[test]
    fn test_create_file_requires_parent() {
        let mut fs = test_fs(MIB);
        assert!(matches!(
            fs.create_file("missing/file.txt"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_create_file_duplicate() {
        let mut fs = test_fs(MIB);
        fs.create_file("a.txt").unwrap();
        assert!(matches!(
            fs.create_file("a.txt"),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_empty_file_owns_no_blocks() {
        let mut fs = test_fs(MIB);
        fs.create_file("empty.txt").unwrap();

        let file = fs.get_file("empty.txt").unwrap();
        assert_eq!(file.size, 0);
        assert_eq!(file.first_chunk_offset, 0);
        assert_eq!(fs.used_block_count().unwrap(), 0);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut fs = test_fs(MIB);
        fs.create_directory("docs").unwrap();
        fs.create_file("docs/hello.txt").unwrap();
        fs.write("docs/hello.txt", b"Hello, World!\0", 0).unwrap();

        let mut buf = [0u8; 14];
        let read = fs.read("docs/hello.txt", 0, &mut buf).unwrap();
        assert_eq!(read, 14);
        assert_eq!(&buf, b"Hello, World!\0");
        assert_eq!(fs.get_file_size("docs/hello.txt").unwrap(), 14);
    }

    #[test]
    fn test_write_spanning_multiple_chunks() {
        let mut fs = test_fs(MIB);
        fs.create_file("big.bin").unwrap();

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        fs.write("big.bin", &data, 0).unwrap();

        let mut buf = vec![0u8; data.len()];
        fs.read("big.bin", 0, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_partial_overwrite() {
        let mut fs = test_fs(MIB);
        fs.create_file("a.txt").unwrap();
        fs.write("a.txt", b"aaaaaaaaaa", 0).unwrap();
        fs.write("a.txt", b"BBB", 4).unwrap();

        let mut buf = [0u8; 10];
        fs.read("a.txt", 0, &mut buf).unwrap();
        assert_eq!(&buf, b"aaaaBBBaaa");
        assert_eq!(fs.get_file_size("a.txt").unwrap(), 10);
    }

    #[test]
    fn test_growth_via_offset() {
        let mut fs = test_fs(MIB);
        fs.create_file("sparse.bin").unwrap();
        fs.write("sparse.bin", b"start", 0).unwrap();

        // Write far past the current end; the gap stays unspecified but
        // must be addressable.
        fs.write("sparse.bin", b"end", 3000).unwrap();
        assert_eq!(fs.get_file_size("sparse.bin").unwrap(), 3003);

        let mut buf = [0u8; 3];
        fs.read("sparse.bin", 3000, &mut buf).unwrap();
        assert_eq!(&buf, b"end");

        let mut head = [0u8; 5];
        fs.read("sparse.bin", 0, &mut head).unwrap();
        assert_eq!(&head, b"start");
    }

    #[test]
    fn test_set_end_of_file_grows_without_content() {
        let mut fs = test_fs(MIB);
        fs.create_file("grown.bin").unwrap();
        fs.set_end_of_file("grown.bin", 5000).unwrap();

        assert_eq!(fs.get_file_size("grown.bin").unwrap(), 5000);
        assert!(fs.used_block_count().unwrap() >= 5);

        // The bytes are unspecified but must be readable.
        let mut buf = vec![0u8; 5000];
        assert_eq!(fs.read("grown.bin", 0, &mut buf).unwrap(), 5000);
    }

    #[test]
    fn test_read_clamps_and_bounds() {
        let mut fs = test_fs(MIB);
        fs.create_file("short.txt").unwrap();
        fs.write("short.txt", b"0123456789", 0).unwrap();

        // Clamped read near the end.
        let mut buf = [0u8; 8];
        assert_eq!(fs.read("short.txt", 8, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");

        // Reads starting past the end are out of bounds.
        assert!(matches!(
            fs.read("short.txt", 11, &mut buf),
            Err(FsError::OutOfBounds { .. })
        ));

        // Reading exactly at the end transfers nothing.
        assert_eq!(fs.read("short.txt", 10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_delete_file_reclaims_blocks() {
        let mut fs = test_fs(MIB);
        fs.create_directory("data").unwrap();
        let baseline = fs.used_block_count().unwrap();

        fs.create_file("data/blob.bin").unwrap();
        fs.write("data/blob.bin", &vec![7u8; 100 * 1024], 0).unwrap();
        assert!(fs.used_block_count().unwrap() > baseline);

        fs.delete_file("data/blob.bin").unwrap();
        assert_eq!(fs.used_block_count().unwrap(), baseline);
        assert!(!fs.file_exists("data/blob.bin"));
    }

    #[test]
    fn test_delete_directory_requires_empty() {
        let mut fs = test_fs(MIB);
        fs.create_directory("d").unwrap();
        fs.create_file("d/f.txt").unwrap();

        assert!(matches!(
            fs.delete_directory("d"),
            Err(FsError::NotEmpty(_))
        ));

        fs.delete_file("d/f.txt").unwrap();
        fs.delete_directory("d").unwrap();
        assert!(!fs.directory_exists("d"));
        assert_eq!(fs.used_block_count().unwrap(), 0);
    }

    #[test]
    fn test_move_within_same_directory() {
        let mut fs = test_fs(MIB);
        fs.create_directory("a").unwrap();
        fs.create_file("a/b").unwrap();
        fs.write("a/b", b"payload", 0).unwrap();

        fs.move_file("a/b", "a/c").unwrap();

        assert!(!fs.file_exists("a/b"));
        let mut buf = [0u8; 7];
        fs.read("a/c", 0, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn test_move_across_directories() {
        let mut fs = test_fs(MIB);
        fs.create_directory("src").unwrap();
        fs.create_directory("dst").unwrap();
        fs.create_file("src/f").unwrap();
        fs.write("src/f", b"content", 0).unwrap();
        let blocks_before = fs.used_block_count().unwrap();

        fs.move_file("src/f", "dst/g").unwrap();

        assert!(!fs.file_exists("src/f"));
        assert!(fs.file_exists("dst/g"));
        // The chain moved by descriptor only.
        assert_eq!(fs.used_block_count().unwrap(), blocks_before);

        let mut buf = [0u8; 7];
        fs.read("dst/g", 0, &mut buf).unwrap();
        assert_eq!(&buf, b"content");
    }

    #[test]
    fn test_move_collision() {
        let mut fs = test_fs(MIB);
        fs.create_file("a").unwrap();
        fs.create_file("b").unwrap();
        assert!(matches!(
            fs.move_file("a", "b"),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_out_of_space() {
        // 64 KiB partition leaves 55 usable blocks.
        let mut fs = test_fs(64 * 1024);
        fs.create_file("big").unwrap();
        assert!(matches!(
            fs.write("big", &vec![1u8; 60_000], 0),
            Err(FsError::OutOfSpace { .. })
        ));
    }

    #[test]
    fn test_oversized_directory() {
        let mut fs = test_fs(MIB);
        fs.create_directory("packed").unwrap();

        let mut hit_limit = false;
        for i in 0..100 {
            match fs.create_file(&format!("packed/file-with-a-long-name-{i:04}")) {
                Ok(()) => {}
                Err(FsError::OversizedDirectory { .. }) => {
                    hit_limit = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(hit_limit, "directory body never overflowed its block");
    }

    #[test]
    fn test_paths_are_case_sensitive() {
        let mut fs = test_fs(MIB);
        fs.create_directory("Foo").unwrap();

        assert!(fs.directory_exists("Foo"));
        assert!(!fs.directory_exists("foo"));
        assert!(matches!(
            fs.get_directory("FOO"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_type_mismatches() {
        let mut fs = test_fs(MIB);
        fs.create_directory("dir").unwrap();
        fs.create_file("file").unwrap();

        assert!(matches!(fs.get_file("dir"), Err(FsError::IsADirectory(_))));
        assert!(matches!(
            fs.get_directory("file"),
            Err(FsError::NotADirectory(_))
        ));
        assert!(matches!(
            fs.delete_file("dir"),
            Err(FsError::IsADirectory(_))
        ));
        assert!(matches!(
            fs.delete_directory("file"),
            Err(FsError::NotADirectory(_))
        ));
        assert!(matches!(
            fs.create_file("file/nested"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_remount_preserves_tree() {
        let size = MIB;
        let mut fs = test_fs(size);
        fs.create_directory("keep/this").unwrap();
        fs.create_file("keep/this/data.bin").unwrap();
        fs.write("keep/this/data.bin", b"durable bytes", 0).unwrap();
        let used = fs.used_block_count().unwrap();

        let store = fs.into_store();
        let mut fs = Filesystem::mount(store, size as u64, 1024).unwrap();

        assert!(fs.directory_exists("keep/this"));
        assert_eq!(fs.get_file_size("keep/this/data.bin").unwrap(), 13);
        assert_eq!(fs.used_block_count().unwrap(), used);

        let mut buf = [0u8; 13];
        fs.read("keep/this/data.bin", 0, &mut buf).unwrap();
        assert_eq!(&buf, b"durable bytes");
    }

    #[test]
    fn test_log_tree_walks_without_error() {
        let mut fs = test_fs(MIB);
        fs.create_directory("a/b").unwrap();
        fs.create_file("a/b/c.txt").unwrap();
        fs.write("a/b/c.txt", &[0u8; 2048], 0).unwrap();
        fs.log_tree();
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(1023), "1023B");
        assert_eq!(format_bytes(1024), "1.00KB");
        assert_eq!(format_bytes(1536), "1.50KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.50GB");
    }
}
