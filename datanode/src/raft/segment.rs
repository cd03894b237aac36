use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_SIZE: u64 = 16; // 8 bytes for start_index + 8 bytes for end_index
const ENTRY_HEADER_SIZE: u64 = 8; // 8 bytes for entry size

/// One file of the raft log holding consecutive entries from `start_index`.
#[derive(Debug)]
pub struct Segment {
    file: File,
    path: PathBuf,
    start_index: u64,
    // start_index - 1 while empty
    end_index: u64,
    entry_positions: BTreeMap<u64, u64>, // index -> file position
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    start_index: u64,
    end_index: u64,
}

fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl Segment {
    pub fn open<P: AsRef<Path>>(path: P, start_index: u64) -> io::Result<Self> {
        if start_index == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "raft log indexes start at 1",
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            path: path.as_ref().to_path_buf(),
            start_index,
            end_index: start_index - 1,
            entry_positions: BTreeMap::new(),
        };

        if segment.file.metadata()?.len() < HEADER_SIZE {
            segment.file.set_len(0)?;
            segment.write_header()?;
        } else {
            segment.read_header()?;
            segment.rebuild_entry_positions()?;
        }

        Ok(segment)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let header = SegmentHeader {
            start_index: self.start_index,
            end_index: self.end_index,
        };
        let header_bytes = bincode::serialize(&header).map_err(invalid_data)?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut header_bytes)?;

        let header: SegmentHeader = bincode::deserialize(&header_bytes).map_err(invalid_data)?;
        if header.start_index != self.start_index {
            return Err(invalid_data(format!(
                "segment {:?} starts at {}, expected {}",
                self.path, header.start_index, self.start_index
            )));
        }
        Ok(())
    }

    fn read_entry_header(&mut self) -> io::Result<u64> {
        let mut size_bytes = [0u8; 8];
        self.file.read_exact(&mut size_bytes)?;
        Ok(u64::from_le_bytes(size_bytes))
    }

    /// Scans the records; a torn record at the tail is cut off.
    fn rebuild_entry_positions(&mut self) -> io::Result<()> {
        self.entry_positions.clear();
        let len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;

        while pos + ENTRY_HEADER_SIZE <= len {
            self.file.seek(SeekFrom::Start(pos))?;
            let entry_size = self.read_entry_header()?;
            if pos + ENTRY_HEADER_SIZE + entry_size > len {
                break;
            }
            let entry_index = self.start_index + self.entry_positions.len() as u64;
            self.entry_positions.insert(entry_index, pos);
            pos += ENTRY_HEADER_SIZE + entry_size;
        }
        if pos < len {
            log::warn!(
                "truncating torn record at offset {} of {:?}",
                pos,
                self.path
            );
            self.file.set_len(pos)?;
        }

        self.end_index = self.start_index + self.entry_positions.len() as u64 - 1;
        self.write_header()
    }

    /// Appends entries that directly follow `end_index`.
    pub fn append(&mut self, entries: &[Vec<u8>]) -> io::Result<()> {
        let mut pos = self.file.seek(SeekFrom::End(0))?;
        let mut buf = Vec::new();
        for entry in entries {
            let entry_index = self.end_index + 1;
            buf.extend_from_slice(&(entry.len() as u64).to_le_bytes());
            buf.extend_from_slice(entry);
            self.entry_positions.insert(entry_index, pos);
            pos += ENTRY_HEADER_SIZE + entry.len() as u64;
            self.end_index = entry_index;
        }
        self.file.write_all(&buf)?;
        self.write_header()
    }

    pub fn read_entry(&mut self, index: u64) -> io::Result<Vec<u8>> {
        let pos = *self.entry_positions.get(&index).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "index {} outside segment [{}, {}]",
                    index, self.start_index, self.end_index
                ),
            )
        })?;

        self.file.seek(SeekFrom::Start(pos))?;
        let entry_size = self.read_entry_header()?;

        let mut entry = vec![0u8; entry_size as usize];
        self.file.read_exact(&mut entry)?;
        Ok(entry)
    }

    /// Reads every entry, oldest first.
    pub fn read_all(&mut self) -> io::Result<Vec<Vec<u8>>> {
        (self.start_index..=self.end_index)
            .map(|index| self.read_entry(index))
            .collect()
    }

    /// Drops `index` and everything after it.
    pub fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        let pos = match self.entry_positions.get(&index) {
            Some(pos) => *pos,
            None => return Ok(()),
        };
        self.file.set_len(pos)?;
        self.entry_positions.split_off(&index);
        self.end_index = index - 1;
        self.write_header()
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Deletes the segment file.
    pub fn remove(self) -> io::Result<()> {
        let path = self.path;
        drop(self.file);
        match fs::remove_file(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    pub fn end_index(&self) -> u64 {
        self.end_index
    }

    pub fn len(&self) -> u64 {
        self.entry_positions.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entry_positions.is_empty()
    }
}
