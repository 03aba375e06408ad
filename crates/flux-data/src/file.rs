//! File (§4.4): an ordered, in-memory-until-spilled sequence of finalized
//! blocks that a `CACHED` DIA node's stage keeps around between executions.
//! At most one writer may be open at a time, and at most one *consuming*
//! reader; any number of *keeping* readers may run concurrently once the
//! writer has closed, each seeing the full sequence independently.

use std::collections::VecDeque;
use std::sync::Arc;

use flux_core::{FluxError, Result};
use parking_lot::Mutex;

use crate::block_ref::BlockRef;
use crate::sink::{BlockSink, BlockSource};

struct FileState {
    refs: VecDeque<BlockRef>,
    num_items: usize,
    num_bytes: usize,
    writer_open: bool,
    writer_ever_opened: bool,
    consuming_reader_open: bool,
}

/// An ordered sequence of blocks, shared by handle so a writer and any
/// number of readers can all refer to the same underlying content.
#[derive(Clone)]
pub struct File {
    state: Arc<Mutex<FileState>>,
}

impl File {
    pub fn new() -> Self {
        File {
            state: Arc::new(Mutex::new(FileState {
                refs: VecDeque::new(),
                num_items: 0,
                num_bytes: 0,
                writer_open: false,
                writer_ever_opened: false,
                consuming_reader_open: false,
            })),
        }
    }

    /// Open a writer. Only one may be open at a time, and a file that has
    /// already been written to once cannot be reopened for writing (a File
    /// is append-once; a fresh stage gets a fresh File).
    pub fn writer(&self) -> Result<FileWriterSink> {
        let mut state = self.state.lock();
        if state.writer_ever_opened {
            return Err(FluxError::misuse("file already has a writer; Files are append-once"));
        }
        state.writer_open = true;
        state.writer_ever_opened = true;
        Ok(FileWriterSink { state: self.state.clone() })
    }

    /// Open a reader. `consume == true` drains the file's own block refs as
    /// they're read, releasing them to the pool as soon as possible and
    /// leaving the file empty afterward; `consume == false` ("keeping")
    /// leaves the file's content intact for later reads.
    pub fn reader(&self, consume: bool) -> Result<FileReaderSource> {
        let mut state = self.state.lock();
        if state.writer_open {
            return Err(FluxError::misuse("cannot read a file whose writer is still open"));
        }
        if consume {
            if state.consuming_reader_open {
                return Err(FluxError::misuse("file already has a consuming reader open"));
            }
            state.consuming_reader_open = true;
            Ok(FileReaderSource::Consuming { state: self.state.clone() })
        } else {
            let snapshot: VecDeque<BlockRef> = state.refs.iter().cloned().collect();
            Ok(FileReaderSource::Keeping { refs: snapshot })
        }
    }

    pub fn num_items(&self) -> usize {
        self.state.lock().num_items
    }

    pub fn num_bytes(&self) -> usize {
        self.state.lock().num_bytes
    }

    pub fn num_blocks(&self) -> usize {
        self.state.lock().refs.len()
    }
}

impl Default for File {
    fn default() -> Self {
        Self::new()
    }
}

/// The writer half of a [`File`], implementing [`BlockSink`].
pub struct FileWriterSink {
    state: Arc<Mutex<FileState>>,
}

impl BlockSink for FileWriterSink {
    fn push(&mut self, block_ref: BlockRef) -> Result<()> {
        let mut state = self.state.lock();
        state.num_items += block_ref.item_count;
        state.num_bytes += block_ref.length;
        state.refs.push_back(block_ref);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.writer_open = false;
        Ok(())
    }
}

/// The reader half of a [`File`], implementing [`BlockSource`].
pub enum FileReaderSource {
    Consuming { state: Arc<Mutex<FileState>> },
    Keeping { refs: VecDeque<BlockRef> },
}

impl BlockSource for FileReaderSource {
    fn next_ref(&mut self) -> Result<Option<BlockRef>> {
        match self {
            FileReaderSource::Consuming { state } => {
                let mut state = state.lock();
                let next = state.refs.pop_front();
                if next.is_none() {
                    state.consuming_reader_open = false;
                }
                Ok(next)
            }
            FileReaderSource::Keeping { refs } => Ok(refs.pop_front()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockPool;
    use crate::reader::Reader;
    use crate::writer::Writer;

    #[test]
    fn keeping_reader_can_be_opened_twice_after_write() {
        let pool = BlockPool::new(4096, std::env::temp_dir());
        let file = File::new();
        let mut writer: Writer<u32, FileWriterSink> = Writer::new(pool, file.writer().unwrap(), 16);
        for i in 0..10u32 {
            writer.put(&i).unwrap();
        }
        writer.finish().unwrap();

        let mut r1: Reader<u32, FileReaderSource> = Reader::new(file.reader(false).unwrap(), false);
        let mut r2: Reader<u32, FileReaderSource> = Reader::new(file.reader(false).unwrap(), false);
        for i in 0..10u32 {
            assert_eq!(r1.next().unwrap(), Some(i));
            assert_eq!(r2.next().unwrap(), Some(i));
        }
        assert_eq!(file.num_items(), 10);
    }

    #[test]
    fn consuming_reader_drains_the_file() {
        let pool = BlockPool::new(4096, std::env::temp_dir());
        let file = File::new();
        let mut writer: Writer<u32, FileWriterSink> = Writer::new(pool, file.writer().unwrap(), 16);
        for i in 0..5u32 {
            writer.put(&i).unwrap();
        }
        writer.finish().unwrap();

        let mut reader: Reader<u32, FileReaderSource> = Reader::new(file.reader(true).unwrap(), true);
        let mut got = Vec::new();
        while let Some(v) = reader.next().unwrap() {
            got.push(v);
        }
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert_eq!(file.num_blocks(), 0);
    }

    #[test]
    fn second_writer_on_same_file_is_rejected() {
        let file = File::new();
        drop(file.writer().unwrap());
        assert!(file.writer().is_err());
    }

    #[test]
    fn reading_before_writer_closes_is_rejected() {
        let file = File::new();
        let _w = file.writer().unwrap();
        assert!(file.reader(false).is_err());
    }
}
