//! # Journal (Write-Ahead Log)
//!
//! Every mutation of a persistent environment is appended here before it
//! touches any page, and the append is synced before the operation returns.
//! After a crash, recovery replays committed transactions from the journal
//! alone.
//!
//! ## Two-File Rotation
//!
//! The journal is a pair of files, `<env>.jrn0` and `<env>.jrn1`. Writes go
//! to the *current* file. When the current file has accumulated
//! `switch_threshold` closed transactions and carries no open ones, the
//! other file is truncated to its header and becomes current. A
//! transaction's commit or abort entry always goes to the file holding its
//! begin entry, so the per-file open/closed counters stay balanced and a
//! file is only ever truncated when none of its transactions are live.
//!
//! ## File Header Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  ----------------------------------------
//! 0       4     magic     b"embj"
//! 4       4     reserved
//! 8       8     lsn       Last allocated LSN when this header was stamped
//! ```
//!
//! ## Entry Header Layout (32 bytes)
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  ----------------------------------------
//! 0       8     lsn
//! 8       8     txn_id
//! 16      8     followup_size  Payload bytes following this header
//! 24      4     flags
//! 28      2     dbname
//! 30      2     type           TxnBegin/TxnAbort/TxnCommit/Insert/Erase/
//!                              Checkpoint
//! ```
//!
//! Insert payloads carry `{key_size, record_size, flags, dup_index,
//! partial_offset, partial_size}` plus the key and record bytes; erase
//! payloads carry `{key_size, flags, dup_index}` plus the key bytes.
//!
//! ## Iteration
//!
//! [`Journal::next_entry`] walks both files in LSN order, starting with
//! the file whose header LSN is older. An exhausted iterator yields `None`
//! (the on-disk sentinel for "no entry" is LSN 0, which is never
//! allocated).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::ErrorKind;

pub const JOURNAL_MAGIC: [u8; 4] = *b"embj";
pub const JOURNAL_HEADER_SIZE: usize = 16;
pub const JOURNAL_ENTRY_HEADER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EntryType {
    TxnBegin = 1,
    TxnAbort = 2,
    TxnCommit = 3,
    Insert = 10,
    Erase = 20,
    Checkpoint = 30,
}

impl EntryType {
    fn from_u16(raw: u16) -> Result<Self> {
        Ok(match raw {
            1 => EntryType::TxnBegin,
            2 => EntryType::TxnAbort,
            3 => EntryType::TxnCommit,
            10 => EntryType::Insert,
            20 => EntryType::Erase,
            30 => EntryType::Checkpoint,
            other => {
                return Err(eyre::Report::from(ErrorKind::LogInvFileHeader)
                    .wrap_err(format!("unknown journal entry type {}", other)))
            }
        })
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct FileHeader {
    magic: [u8; 4],
    reserved: U32,
    lsn: U64,
}

const _: () = assert!(size_of::<FileHeader>() == JOURNAL_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct EntryHeader {
    lsn: U64,
    txn_id: U64,
    followup_size: U64,
    flags: U32,
    dbname: U16,
    entry_type: U16,
}

const _: () = assert!(size_of::<EntryHeader>() == JOURNAL_ENTRY_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct InsertAux {
    key_size: U16,
    reserved: U16,
    record_size: U32,
    flags: U32,
    dup_index: U32,
    partial_offset: U32,
    partial_size: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct EraseAux {
    key_size: U16,
    reserved: U16,
    flags: U32,
    dup_index: U32,
}

/// A decoded journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub lsn: u64,
    pub txn_id: u64,
    pub dbname: u16,
    pub entry_type: EntryType,
    pub flags: u32,
    pub payload: JournalPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalPayload {
    None,
    Insert {
        key: Vec<u8>,
        record: Vec<u8>,
        flags: u32,
        dup_index: u32,
        partial_offset: u32,
        partial_size: u32,
    },
    Erase {
        key: Vec<u8>,
        flags: u32,
        dup_index: u32,
    },
}

/// Cursor state for [`Journal::next_entry`].
#[derive(Debug, Default, Clone)]
pub struct JournalIterator {
    started: bool,
    /// Index into `files`, not a file descriptor.
    file: usize,
    second_file: usize,
    on_second: bool,
    offset: u64,
}

#[derive(Debug)]
pub struct Journal {
    paths: [PathBuf; 2],
    files: [File; 2],
    sizes: [u64; 2],
    header_lsns: [u64; 2],
    current: usize,
    open_txns: [usize; 2],
    closed_txns: [usize; 2],
    switch_threshold: usize,
    last_checkpoint_lsn: u64,
}

fn journal_paths(base: &Path) -> [PathBuf; 2] {
    let display = base.to_string_lossy();
    [
        PathBuf::from(format!("{}.jrn0", display)),
        PathBuf::from(format!("{}.jrn1", display)),
    ]
}

impl Journal {
    /// Creates both journal files with fresh headers. Partially created
    /// files are removed again on any error.
    pub fn create(base: &Path, switch_threshold: usize) -> Result<Self> {
        let paths = journal_paths(base);
        match Self::create_inner(&paths, switch_threshold) {
            Ok(journal) => Ok(journal),
            Err(err) => {
                for path in &paths {
                    let _ = std::fs::remove_file(path);
                }
                Err(err)
            }
        }
    }

    fn create_inner(paths: &[PathBuf; 2], switch_threshold: usize) -> Result<Self> {
        let mut files = Vec::with_capacity(2);
        for path in paths {
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
                .wrap_err_with(|| format!("failed to create journal file at {:?}", path))?;
            let header = FileHeader {
                magic: JOURNAL_MAGIC,
                reserved: U32::new(0),
                lsn: U64::new(0),
            };
            file.write_all(header.as_bytes())
                .and_then(|_| file.sync_all())
                .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
                .wrap_err("failed to write journal file header")?;
            files.push(file);
        }
        let files: [File; 2] = files.try_into().expect("two journal files");

        Ok(Self {
            paths: paths.clone(),
            files,
            sizes: [JOURNAL_HEADER_SIZE as u64; 2],
            header_lsns: [0; 2],
            current: 0,
            open_txns: [0; 2],
            closed_txns: [0; 2],
            switch_threshold,
            last_checkpoint_lsn: 0,
        })
    }

    /// Opens an existing journal pair, validating headers and rebuilding
    /// the per-file transaction counters from the entries.
    pub fn open(base: &Path, switch_threshold: usize) -> Result<Self> {
        let paths = journal_paths(base);
        let mut files = Vec::with_capacity(2);
        let mut sizes = [0u64; 2];
        let mut header_lsns = [0u64; 2];

        for (i, path) in paths.iter().enumerate() {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| {
                    let kind = if e.kind() == std::io::ErrorKind::NotFound {
                        ErrorKind::FileNotFound
                    } else {
                        ErrorKind::Io
                    };
                    eyre::Report::new(e).wrap_err(kind)
                })
                .wrap_err_with(|| format!("failed to open journal file at {:?}", path))?;

            let mut raw = [0u8; JOURNAL_HEADER_SIZE];
            file.read_exact(&mut raw)
                .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::LogInvFileHeader))
                .wrap_err_with(|| format!("journal file {:?} shorter than its header", path))?;
            let header = FileHeader::ref_from_bytes(&raw)
                .map_err(|e| eyre::eyre!("failed to parse journal header: {:?}", e))?;
            if header.magic != JOURNAL_MAGIC {
                return Err(eyre::Report::from(ErrorKind::LogInvFileHeader).wrap_err(format!(
                    "bad magic in journal file {:?}: {:02x?}",
                    path, header.magic
                )));
            }

            header_lsns[i] = header.lsn.get();
            sizes[i] = file
                .metadata()
                .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))?
                .len();
            files.push(file);
        }
        let files: [File; 2] = files.try_into().expect("two journal files");

        let mut journal = Self {
            paths,
            files,
            sizes,
            header_lsns,
            current: 0,
            open_txns: [0; 2],
            closed_txns: [0; 2],
            switch_threshold,
            last_checkpoint_lsn: 0,
        };

        // Rebuild counters and pick the file with the newest entries as
        // the append target.
        let mut max_lsn = [0u64; 2];
        for file in 0..2 {
            let mut offset = JOURNAL_HEADER_SIZE as u64;
            while let Some(entry) = journal.read_entry_at(file, &mut offset)? {
                max_lsn[file] = max_lsn[file].max(entry.lsn);
                match entry.entry_type {
                    EntryType::TxnBegin => journal.open_txns[file] += 1,
                    EntryType::TxnAbort | EntryType::TxnCommit => {
                        journal.open_txns[file] = journal.open_txns[file].saturating_sub(1);
                        journal.closed_txns[file] += 1;
                    }
                    _ => {}
                }
            }
        }
        journal.current = if max_lsn[1].max(journal.header_lsns[1])
            > max_lsn[0].max(journal.header_lsns[0])
        {
            1
        } else {
            0
        };
        Ok(journal)
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.iter().all(|&s| s == JOURNAL_HEADER_SIZE as u64)
    }

    /// Largest LSN recorded anywhere in the journal (headers included).
    pub fn max_lsn(&mut self) -> Result<u64> {
        let mut max = self.header_lsns[0].max(self.header_lsns[1]);
        let mut it = JournalIterator::default();
        while let Some(entry) = self.next_entry(&mut it)? {
            max = max.max(entry.lsn);
        }
        Ok(max)
    }

    pub fn last_checkpoint_lsn(&self) -> u64 {
        self.last_checkpoint_lsn
    }

    pub fn open_txn_count(&self, file: usize) -> usize {
        self.open_txns[file]
    }

    pub fn closed_txn_count(&self, file: usize) -> usize {
        self.closed_txns[file]
    }

    pub fn current_file(&self) -> usize {
        self.current
    }

    // -- appending ----------------------------------------------------------

    fn append_raw(
        &mut self,
        file: usize,
        header: &EntryHeader,
        payload: &[&[u8]],
    ) -> Result<()> {
        let target = &mut self.files[file];
        target
            .seek(SeekFrom::Start(self.sizes[file]))
            .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))?;
        target
            .write_all(header.as_bytes())
            .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
            .wrap_err("failed to append journal entry header")?;
        let mut written = JOURNAL_ENTRY_HEADER_SIZE as u64;
        for chunk in payload {
            target
                .write_all(chunk)
                .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
                .wrap_err("failed to append journal entry payload")?;
            written += chunk.len() as u64;
        }
        target
            .sync_all()
            .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
            .wrap_err("failed to sync journal file")?;
        self.sizes[file] += written;
        Ok(())
    }

    fn entry_header(
        lsn: u64,
        txn_id: u64,
        followup: usize,
        flags: u32,
        dbname: u16,
        entry_type: EntryType,
    ) -> EntryHeader {
        EntryHeader {
            lsn: U64::new(lsn),
            txn_id: U64::new(txn_id),
            followup_size: U64::new(followup as u64),
            flags: U32::new(flags),
            dbname: U16::new(dbname),
            entry_type: U16::new(entry_type as u16),
        }
    }

    /// Appends a `TxnBegin` entry, switching files first when the current
    /// one is saturated. Returns the file index the transaction lives in;
    /// its terminal entry must go to the same file.
    pub fn append_txn_begin(&mut self, txn_id: u64, dbname: u16, lsn: u64) -> Result<usize> {
        if self.open_txns[self.current] == 0
            && self.closed_txns[self.current] >= self.switch_threshold
        {
            self.switch_file(lsn.saturating_sub(1))?;
        }

        let file = self.current;
        let header = Self::entry_header(lsn, txn_id, 0, 0, dbname, EntryType::TxnBegin);
        self.append_raw(file, &header, &[])?;
        self.open_txns[file] += 1;
        Ok(file)
    }

    pub fn append_txn_commit(&mut self, txn_id: u64, file: usize, lsn: u64) -> Result<()> {
        let header = Self::entry_header(lsn, txn_id, 0, 0, 0, EntryType::TxnCommit);
        self.append_raw(file, &header, &[])?;
        self.open_txns[file] = self.open_txns[file].saturating_sub(1);
        self.closed_txns[file] += 1;
        Ok(())
    }

    pub fn append_txn_abort(&mut self, txn_id: u64, file: usize, lsn: u64) -> Result<()> {
        let header = Self::entry_header(lsn, txn_id, 0, 0, 0, EntryType::TxnAbort);
        self.append_raw(file, &header, &[])?;
        self.open_txns[file] = self.open_txns[file].saturating_sub(1);
        self.closed_txns[file] += 1;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_insert(
        &mut self,
        dbname: u16,
        txn_id: u64,
        file: usize,
        key: &[u8],
        record: &[u8],
        flags: u32,
        dup_index: u32,
        partial_offset: u32,
        partial_size: u32,
        lsn: u64,
    ) -> Result<()> {
        let aux = InsertAux {
            key_size: U16::new(key.len() as u16),
            reserved: U16::new(0),
            record_size: U32::new(record.len() as u32),
            flags: U32::new(flags),
            dup_index: U32::new(dup_index),
            partial_offset: U32::new(partial_offset),
            partial_size: U32::new(partial_size),
        };
        let followup = size_of::<InsertAux>() + key.len() + record.len();
        let header = Self::entry_header(lsn, txn_id, followup, 0, dbname, EntryType::Insert);
        self.append_raw(file, &header, &[aux.as_bytes(), key, record])
    }

    pub fn append_erase(
        &mut self,
        dbname: u16,
        txn_id: u64,
        file: usize,
        key: &[u8],
        flags: u32,
        dup_index: u32,
        lsn: u64,
    ) -> Result<()> {
        let aux = EraseAux {
            key_size: U16::new(key.len() as u16),
            reserved: U16::new(0),
            flags: U32::new(flags),
            dup_index: U32::new(dup_index),
        };
        let followup = size_of::<EraseAux>() + key.len();
        let header = Self::entry_header(lsn, txn_id, followup, 0, dbname, EntryType::Erase);
        self.append_raw(file, &header, &[aux.as_bytes(), key])
    }

    /// Records that everything up to `lsn` is durable in the main file.
    pub fn append_checkpoint(&mut self, lsn: u64) -> Result<()> {
        let header = Self::entry_header(lsn, 0, 0, 0, 0, EntryType::Checkpoint);
        self.append_raw(self.current, &header, &[])?;
        self.last_checkpoint_lsn = lsn;
        Ok(())
    }

    fn switch_file(&mut self, last_lsn: u64) -> Result<()> {
        let other = 1 - self.current;
        self.truncate_file(other, last_lsn)?;
        self.current = other;
        Ok(())
    }

    fn truncate_file(&mut self, file: usize, last_lsn: u64) -> Result<()> {
        let header = FileHeader {
            magic: JOURNAL_MAGIC,
            reserved: U32::new(0),
            lsn: U64::new(last_lsn),
        };
        let target = &mut self.files[file];
        target
            .set_len(0)
            .and_then(|_| target.seek(SeekFrom::Start(0)))
            .and_then(|_| target.write_all(header.as_bytes()))
            .and_then(|_| target.sync_all())
            .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
            .wrap_err_with(|| format!("failed to truncate journal file {:?}", self.paths[file]))?;

        self.sizes[file] = JOURNAL_HEADER_SIZE as u64;
        self.header_lsns[file] = last_lsn;
        self.open_txns[file] = 0;
        self.closed_txns[file] = 0;
        Ok(())
    }

    /// Truncates both files to bare headers. `last_lsn` keeps the LSN
    /// sequence continuous across the clear.
    pub fn clear(&mut self, last_lsn: u64) -> Result<()> {
        self.truncate_file(0, last_lsn)?;
        self.truncate_file(1, last_lsn)?;
        self.last_checkpoint_lsn = last_lsn;
        self.current = 0;
        Ok(())
    }

    // -- iteration ----------------------------------------------------------

    fn read_entry_at(&mut self, file: usize, offset: &mut u64) -> Result<Option<JournalEntry>> {
        if *offset >= self.sizes[file] {
            return Ok(None);
        }

        let source = &mut self.files[file];
        source
            .seek(SeekFrom::Start(*offset))
            .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))?;

        let mut raw = [0u8; JOURNAL_ENTRY_HEADER_SIZE];
        source
            .read_exact(&mut raw)
            .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
            .wrap_err("failed to read journal entry header")?;
        let header = EntryHeader::ref_from_bytes(&raw)
            .map_err(|e| eyre::eyre!("failed to parse journal entry header: {:?}", e))?;

        let followup = header.followup_size.get() as usize;
        let mut payload_bytes = vec![0u8; followup];
        if followup > 0 {
            source
                .read_exact(&mut payload_bytes)
                .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))
                .wrap_err("failed to read journal entry payload")?;
        }

        let entry_type = EntryType::from_u16(header.entry_type.get())?;
        let payload = match entry_type {
            EntryType::Insert => {
                let aux_size = size_of::<InsertAux>();
                ensure!(followup >= aux_size, "insert entry payload truncated");
                let aux = InsertAux::ref_from_bytes(&payload_bytes[..aux_size])
                    .map_err(|e| eyre::eyre!("failed to parse insert payload: {:?}", e))?;
                let key_size = aux.key_size.get() as usize;
                let record_size = aux.record_size.get() as usize;
                ensure!(
                    followup == aux_size + key_size + record_size,
                    "insert entry payload size mismatch"
                );
                JournalPayload::Insert {
                    key: payload_bytes[aux_size..aux_size + key_size].to_vec(),
                    record: payload_bytes[aux_size + key_size..].to_vec(),
                    flags: aux.flags.get(),
                    dup_index: aux.dup_index.get(),
                    partial_offset: aux.partial_offset.get(),
                    partial_size: aux.partial_size.get(),
                }
            }
            EntryType::Erase => {
                let aux_size = size_of::<EraseAux>();
                ensure!(followup >= aux_size, "erase entry payload truncated");
                let aux = EraseAux::ref_from_bytes(&payload_bytes[..aux_size])
                    .map_err(|e| eyre::eyre!("failed to parse erase payload: {:?}", e))?;
                let key_size = aux.key_size.get() as usize;
                ensure!(
                    followup == aux_size + key_size,
                    "erase entry payload size mismatch"
                );
                JournalPayload::Erase {
                    key: payload_bytes[aux_size..aux_size + key_size].to_vec(),
                    flags: aux.flags.get(),
                    dup_index: aux.dup_index.get(),
                }
            }
            _ => JournalPayload::None,
        };

        *offset += (JOURNAL_ENTRY_HEADER_SIZE + followup) as u64;
        Ok(Some(JournalEntry {
            lsn: header.lsn.get(),
            txn_id: header.txn_id.get(),
            dbname: header.dbname.get(),
            entry_type,
            flags: header.flags.get(),
            payload,
        }))
    }

    /// Yields entries across both files in LSN order; `None` at the end.
    pub fn next_entry(&mut self, it: &mut JournalIterator) -> Result<Option<JournalEntry>> {
        if !it.started {
            it.started = true;
            // Begin with the file whose header is older.
            it.file = if self.header_lsns[0] <= self.header_lsns[1] { 0 } else { 1 };
            it.second_file = 1 - it.file;
            it.on_second = false;
            it.offset = JOURNAL_HEADER_SIZE as u64;
        }

        loop {
            let file = if it.on_second { it.second_file } else { it.file };
            let mut offset = it.offset;
            if let Some(entry) = self.read_entry_at(file, &mut offset)? {
                it.offset = offset;
                return Ok(Some(entry));
            }
            if it.on_second {
                return Ok(None);
            }
            it.on_second = true;
            it.offset = JOURNAL_HEADER_SIZE as u64;
        }
    }

    /// Closes the journal, optionally clearing it first.
    pub fn close(&mut self, clear: bool, last_lsn: u64) -> Result<()> {
        if clear {
            self.clear(last_lsn)?;
        }
        for file in &mut self.files {
            file.sync_all()
                .map_err(|e| eyre::Report::new(e).wrap_err(ErrorKind::Io))?;
        }
        Ok(())
    }

}
