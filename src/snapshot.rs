//! Binary snapshot codec.
//!
//! Layout (all integers little-endian, no padding):
//!
//! ```text
//! magic[4] = "FSDB"
//! major_ver : u8   minor_ver : u8
//! flags : u64
//! num_folders : u32   num_files : u32
//! folder_block_size : u64   file_block_size : u64   (patched after writing)
//! num_indexes : u32   num_excludes : u32            (currently 0)
//! <folder block> <file block> <sorted-arrays block>
//! ```
//!
//! Records share a delta-encoded name (`offset`, `len`, suffix bytes against
//! the previous record's name), conditional size/mtime fields gated by the
//! flags, and a `parent_idx` into the folder block; a folder whose
//! `parent_idx` equals its own index is a root. The sorted-arrays block
//! stores, per non-Name sort key, the permutation mapping positions in that
//! order to positions in the name order.
//!
//! Saving goes through `<file>.tmp` plus an atomic rename, with an exclusive
//! advisory lock held on whichever file is open. Loading is all-or-nothing.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use log::debug;

use crate::config::PropertyFlags;
use crate::entry::{Entry, EntryKind};
use crate::error::{Error, Result};
use crate::sort::{NUM_SORT_KEYS, SortKey};
use crate::store::IndexStore;

const MAGIC: [u8; 4] = *b"FSDB";
const MAJOR_VERSION: u8 = 1;
const MINOR_VERSION: u8 = 1;

/// Offset of `folder_block_size`, the first of the two patched fields.
const BLOCK_SIZE_OFFSET: u64 = 4 + 1 + 1 + 8 + 4 + 4;

/// Decoded snapshot contents: per sort key, the entries in that order. Slot
/// 0 (Name) is always populated; the others mirror the sorted-arrays block.
pub(crate) struct SnapshotData {
    pub flags: PropertyFlags,
    pub folders: [Option<Vec<Arc<Entry>>>; NUM_SORT_KEYS],
    pub files: [Option<Vec<Arc<Entry>>>; NUM_SORT_KEYS],
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Serialize the store to `path` atomically. On failure the temporary file
/// is unlinked and the previous snapshot, if any, is left untouched.
pub(crate) fn save(store: &IndexStore, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp_path = tmp_path_for(path);
    debug!("writing snapshot to {}", tmp_path.display());

    if let Err(error) = write_snapshot(store, &tmp_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(error);
    }

    let _ = fs::remove_file(path);
    if let Err(error) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(error.into());
    }
    debug!("snapshot saved to {}", path.display());
    Ok(())
}

fn write_snapshot(store: &IndexStore, tmp_path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp_path)?;
    file.try_lock_exclusive()?;
    let mut writer = BufWriter::new(file);

    let folders = store
        .get_folders(SortKey::Name)
        .map(|c| c.joined())
        .unwrap_or_default();
    let files = store
        .get_files(SortKey::Name)
        .map(|c| c.joined())
        .unwrap_or_default();

    // Refresh the wire identities: an entry's idx is its position in the
    // name-sorted sequence for the lifetime of this snapshot pass.
    for (i, entry) in folders.iter().enumerate() {
        entry.set_idx(i as u32);
    }
    for (i, entry) in files.iter().enumerate() {
        entry.set_idx(i as u32);
    }

    let flags = store.flags();
    writer.write_all(&MAGIC)?;
    writer.write_all(&[MAJOR_VERSION, MINOR_VERSION])?;
    writer.write_all(&flags.bits().to_le_bytes())?;
    writer.write_all(&(folders.len() as u32).to_le_bytes())?;
    writer.write_all(&(files.len() as u32).to_le_bytes())?;
    writer.write_all(&0u64.to_le_bytes())?; // folder_block_size, patched below
    writer.write_all(&0u64.to_le_bytes())?; // file_block_size, patched below
    writer.write_all(&0u32.to_le_bytes())?; // num_indexes
    writer.write_all(&0u32.to_le_bytes())?; // num_excludes

    let folder_block_size = write_folder_block(&mut writer, flags, &folders)?;
    let file_block_size = write_file_block(&mut writer, flags, &files)?;
    write_sorted_arrays(&mut writer, store)?;

    writer.flush()?;
    let mut file = writer
        .into_inner()
        .map_err(|error| Error::Io(error.into_error()))?;
    file.seek(SeekFrom::Start(BLOCK_SIZE_OFFSET))?;
    file.write_all(&folder_block_size.to_le_bytes())?;
    file.write_all(&file_block_size.to_le_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn write_folder_block(
    writer: &mut impl Write,
    flags: PropertyFlags,
    folders: &[Arc<Entry>],
) -> Result<u64> {
    let mut codec = NameCodec::default();
    let mut bytes: u64 = 0;
    for entry in folders {
        writer.write_all(&(entry.db_index() as u16).to_le_bytes())?;
        bytes += 2;
        let parent_idx = entry.parent().map_or(entry.idx(), |parent| parent.idx());
        bytes += write_entry_super(writer, flags, entry, parent_idx, &mut codec)?;
    }
    Ok(bytes)
}

fn write_file_block(
    writer: &mut impl Write,
    flags: PropertyFlags,
    files: &[Arc<Entry>],
) -> Result<u64> {
    let mut codec = NameCodec::default();
    let mut bytes: u64 = 0;
    for entry in files {
        let parent_idx = entry
            .parent()
            .map(|parent| parent.idx())
            .ok_or_else(|| Error::corrupt("file entry without a parent"))?;
        bytes += write_entry_super(writer, flags, entry, parent_idx, &mut codec)?;
    }
    Ok(bytes)
}

fn write_entry_super(
    writer: &mut impl Write,
    flags: PropertyFlags,
    entry: &Arc<Entry>,
    parent_idx: u32,
    codec: &mut NameCodec,
) -> Result<u64> {
    let mut bytes = codec.encode(entry.name(), writer)? as u64;
    if flags.contains(PropertyFlags::SIZE) {
        writer.write_all(&entry.size().to_le_bytes())?;
        bytes += 8;
    }
    if flags.contains(PropertyFlags::MODIFICATION_TIME) {
        writer.write_all(&(entry.mtime() as u64).to_le_bytes())?;
        bytes += 8;
    }
    writer.write_all(&parent_idx.to_le_bytes())?;
    Ok(bytes + 4)
}

fn write_sorted_arrays(writer: &mut impl Write, store: &IndexStore) -> Result<()> {
    let mut keyed = Vec::new();
    for key in SortKey::ALL.into_iter().skip(1) {
        if let (Some(folders), Some(files)) = (store.get_folders(key), store.get_files(key)) {
            keyed.push((key, folders, files));
        }
    }

    writer.write_all(&(keyed.len() as u32).to_le_bytes())?;
    for (key, folders, files) in keyed {
        writer.write_all(&key.as_u32().to_le_bytes())?;
        for entry in folders.joined() {
            writer.write_all(&entry.idx().to_le_bytes())?;
        }
        for entry in files.joined() {
            writer.write_all(&entry.idx().to_le_bytes())?;
        }
    }
    Ok(())
}

/// Decode a snapshot. Any short read, bad version or out-of-range id aborts
/// with no visible state.
pub(crate) fn load(path: &Path) -> Result<SnapshotData> {
    let file = File::open(path)?;
    file.try_lock_exclusive()?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(Error::corrupt("bad magic number"));
    }
    let major = read_u8(&mut reader)?;
    if major != MAJOR_VERSION {
        return Err(Error::corrupt(format!("unsupported major version {major}")));
    }
    let minor = read_u8(&mut reader)?;
    if minor > MINOR_VERSION {
        return Err(Error::corrupt(format!("unsupported minor version {minor}")));
    }

    let flags = PropertyFlags::from_bits_truncate(read_u64(&mut reader)?);
    let num_folders = read_u32(&mut reader)? as usize;
    let num_files = read_u32(&mut reader)? as usize;
    let folder_block_size = read_u64(&mut reader)?;
    let file_block_size = read_u64(&mut reader)?;
    let num_indexes = read_u32(&mut reader)?;
    let num_excludes = read_u32(&mut reader)?;
    if num_indexes != 0 || num_excludes != 0 {
        debug!("snapshot carries {num_indexes} indexes / {num_excludes} excludes, ignored");
    }

    let folders = load_folder_block(&mut reader, flags, num_folders, folder_block_size)?;
    let files = load_file_block(&mut reader, flags, &folders, num_files, file_block_size)?;

    let mut data = SnapshotData {
        flags,
        folders: Default::default(),
        files: Default::default(),
    };

    let num_sorted_arrays = read_u32(&mut reader)?;
    for _ in 0..num_sorted_arrays {
        let id = read_u32(&mut reader)?;
        if id == 0 || id >= NUM_SORT_KEYS as u32 {
            return Err(Error::corrupt(format!("unsupported sorted array id {id}")));
        }
        let sorted_folders = load_permutation(&mut reader, &folders)?;
        let sorted_files = load_permutation(&mut reader, &files)?;
        data.folders[id as usize] = Some(sorted_folders);
        data.files[id as usize] = Some(sorted_files);
    }

    data.folders[0] = Some(folders);
    data.files[0] = Some(files);
    Ok(data)
}

fn load_folder_block(
    reader: &mut impl Read,
    flags: PropertyFlags,
    num_folders: usize,
    block_size: u64,
) -> Result<Vec<Arc<Entry>>> {
    let mut block = vec![0u8; block_size as usize];
    reader.read_exact(&mut block)?;
    let mut cursor: &[u8] = &block;

    struct RawFolder {
        name: String,
        db_index: u16,
        size: u64,
        mtime: i64,
        parent_idx: u32,
    }

    let mut codec = NameCodec::default();
    let mut raw = Vec::with_capacity(num_folders);
    for _ in 0..num_folders {
        let db_index = read_u16(&mut cursor)?;
        let name = codec.decode(&mut cursor)?;
        let size = if flags.contains(PropertyFlags::SIZE) {
            read_u64(&mut cursor)?
        } else {
            0
        };
        let mtime = if flags.contains(PropertyFlags::MODIFICATION_TIME) {
            read_u64(&mut cursor)? as i64
        } else {
            0
        };
        let parent_idx = read_u32(&mut cursor)?;
        raw.push(RawFolder {
            name,
            db_index,
            size,
            mtime,
            parent_idx,
        });
    }
    if !cursor.is_empty() {
        return Err(Error::corrupt("folder block size mismatch"));
    }

    // Parents may reference folders later in the block; create everything
    // first, wire parents second.
    let folders: Vec<Arc<Entry>> = raw
        .iter()
        .map(|r| {
            Entry::new_unparented(
                EntryKind::Folder,
                &r.name,
                u32::from(r.db_index),
                r.size,
                r.mtime,
            )
        })
        .collect();
    for (i, r) in raw.iter().enumerate() {
        folders[i].set_idx(i as u32);
        if r.parent_idx == i as u32 {
            folders[i].set_parent(None);
        } else if (r.parent_idx as usize) < folders.len() {
            folders[i].set_parent(Some(Arc::clone(&folders[r.parent_idx as usize])));
        } else {
            return Err(Error::corrupt(format!(
                "folder parent index {} out of range",
                r.parent_idx
            )));
        }
    }

    // A malformed file could wire the parent links into a loop; every chain
    // must terminate within the folder count.
    for folder in &folders {
        let mut steps = 0usize;
        let mut current = folder.parent();
        while let Some(next) = current {
            steps += 1;
            if steps > folders.len() {
                return Err(Error::corrupt("folder parent chain contains a cycle"));
            }
            current = next.parent();
        }
    }

    Ok(folders)
}

fn load_file_block(
    reader: &mut impl Read,
    flags: PropertyFlags,
    folders: &[Arc<Entry>],
    num_files: usize,
    block_size: u64,
) -> Result<Vec<Arc<Entry>>> {
    let mut block = vec![0u8; block_size as usize];
    reader.read_exact(&mut block)?;
    let mut cursor: &[u8] = &block;

    let mut codec = NameCodec::default();
    let mut files = Vec::with_capacity(num_files);
    for i in 0..num_files {
        let name = codec.decode(&mut cursor)?;
        let size = if flags.contains(PropertyFlags::SIZE) {
            read_u64(&mut cursor)?
        } else {
            0
        };
        let mtime = if flags.contains(PropertyFlags::MODIFICATION_TIME) {
            read_u64(&mut cursor)? as i64
        } else {
            0
        };
        let parent_idx = read_u32(&mut cursor)? as usize;
        let parent = folders
            .get(parent_idx)
            .ok_or_else(|| Error::corrupt(format!("file parent index {parent_idx} out of range")))?;
        let file = Entry::new_file(&name, size, mtime, Arc::clone(parent));
        file.set_idx(i as u32);
        files.push(file);
    }
    if !cursor.is_empty() {
        return Err(Error::corrupt("file block size mismatch"));
    }
    Ok(files)
}

fn load_permutation(
    reader: &mut impl Read,
    name_sorted: &[Arc<Entry>],
) -> Result<Vec<Arc<Entry>>> {
    let mut sorted = Vec::with_capacity(name_sorted.len());
    for _ in 0..name_sorted.len() {
        let idx = read_u32(reader)? as usize;
        let entry = name_sorted
            .get(idx)
            .ok_or_else(|| Error::corrupt(format!("sorted array index {idx} out of range")))?;
        sorted.push(Arc::clone(entry));
    }
    Ok(sorted)
}

/// Delta codec for record names: each name is stored as the length of the
/// prefix it shares with its predecessor plus the differing suffix.
#[derive(Default)]
struct NameCodec {
    previous: Vec<u8>,
}

impl NameCodec {
    fn encode(&mut self, name: &str, out: &mut impl Write) -> Result<usize> {
        let name = name.as_bytes();
        let mut offset = 0;
        while offset < 255
            && offset < name.len()
            && offset < self.previous.len()
            && name[offset] == self.previous[offset]
        {
            offset += 1;
        }
        let suffix = &name[offset..];
        if suffix.len() > usize::from(u8::MAX) {
            return Err(Error::corrupt(format!(
                "entry name too long for snapshot: {} bytes",
                name.len()
            )));
        }
        out.write_all(&[offset as u8, suffix.len() as u8])?;
        out.write_all(suffix)?;
        self.previous.truncate(offset);
        self.previous.extend_from_slice(suffix);
        Ok(2 + suffix.len())
    }

    fn decode(&mut self, input: &mut impl Read) -> Result<String> {
        let offset = usize::from(read_u8(input)?);
        let len = usize::from(read_u8(input)?);
        if offset > self.previous.len() {
            return Err(Error::corrupt("name offset past previous name"));
        }
        self.previous.truncate(offset);
        let mut suffix = vec![0u8; len];
        input.read_exact(&mut suffix)?;
        self.previous.extend_from_slice(&suffix);
        String::from_utf8(self.previous.clone())
            .map_err(|_| Error::corrupt("entry name is not valid UTF-8"))
    }
}

fn read_u8(reader: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16(reader: &mut impl Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
