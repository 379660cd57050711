//! Segmentation of source files into file data segments.
//!
//! The [SegmentationChain] holds an ordered list of [SegmentationStrategy]s. The first strategy
//! which supports a source file creates its [Segmenter]. If no strategy matches, the
//! [FixedSizeSegmenter] is used.
use std::sync::Arc;

use crate::{
    filestore::{FilestoreError, VirtualFilestore},
    pdu::{RecordContinuationState, SegmentMetadata},
    LocalEntityConfig,
};

#[derive(Debug, thiserror::Error)]
pub enum SegmenterError {
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("segmenter already closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSegment {
    pub offset: u64,
    pub data: Vec<u8>,
    pub segment_metadata: Option<SegmentMetadata>,
}

/// Lazily produces the segments of one file. `Ok(None)` marks the end of the data. A segmenter
/// can not be restarted.
pub trait Segmenter: Send {
    fn next_segment(&mut self) -> Result<Option<FileSegment>, SegmenterError>;
    fn close(&mut self);
}

pub trait SegmentationStrategy: Send + Sync {
    fn supports(
        &self,
        local_cfg: &LocalEntityConfig,
        filestore: &dyn VirtualFilestore,
        source_file: &str,
    ) -> bool;

    /// Whether the segments respect record boundaries.
    fn preserves_record_boundaries(&self) -> bool {
        false
    }

    fn new_segmenter(
        &self,
        filestore: Arc<dyn VirtualFilestore>,
        source_file: &str,
        max_segment_len: usize,
    ) -> Result<Box<dyn Segmenter>, SegmenterError>;
}

/// Cuts a file into segments of the maximum segment length.
pub struct FixedSizeSegmenter {
    filestore: Arc<dyn VirtualFilestore>,
    source_file: String,
    file_size: u64,
    offset: u64,
    max_segment_len: usize,
    closed: bool,
}

impl FixedSizeSegmenter {
    pub fn new(
        filestore: Arc<dyn VirtualFilestore>,
        source_file: &str,
        max_segment_len: usize,
    ) -> Result<Self, SegmenterError> {
        let file_size = filestore.file_size(source_file)?;
        Ok(Self {
            filestore,
            source_file: source_file.to_string(),
            file_size,
            offset: 0,
            max_segment_len: max_segment_len.max(1),
            closed: false,
        })
    }
}

impl Segmenter for FixedSizeSegmenter {
    fn next_segment(&mut self) -> Result<Option<FileSegment>, SegmenterError> {
        if self.closed {
            return Err(SegmenterError::Closed);
        }
        if self.offset >= self.file_size {
            return Ok(None);
        }
        let len = (self.file_size - self.offset).min(self.max_segment_len as u64);
        let mut data = vec![0; len as usize];
        self.filestore
            .read_data(&self.source_file, self.offset, len, &mut data)?;
        let segment = FileSegment {
            offset: self.offset,
            data,
            segment_metadata: None,
        };
        self.offset += len;
        Ok(Some(segment))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Fallback strategy which supports every file.
#[derive(Debug, Default, Copy, Clone)]
pub struct FixedSizeStrategy;

impl SegmentationStrategy for FixedSizeStrategy {
    fn supports(
        &self,
        _local_cfg: &LocalEntityConfig,
        _filestore: &dyn VirtualFilestore,
        _source_file: &str,
    ) -> bool {
        true
    }

    fn new_segmenter(
        &self,
        filestore: Arc<dyn VirtualFilestore>,
        source_file: &str,
        max_segment_len: usize,
    ) -> Result<Box<dyn Segmenter>, SegmenterError> {
        Ok(Box::new(FixedSizeSegmenter::new(
            filestore,
            source_file,
            max_segment_len,
        )?))
    }
}

/// Segments files of delimiter separated records, for example text files with one record per
/// line. Records longer than the maximum segment length are split and flagged with the matching
/// [RecordContinuationState].
#[derive(Debug, Clone)]
pub struct DelimitedRecordStrategy {
    pub delimiter: u8,
    pub extensions: Vec<String>,
}

impl DelimitedRecordStrategy {
    pub fn new_for_text_lines() -> Self {
        Self {
            delimiter: b'\n',
            extensions: vec!["txt".into(), "log".into(), "csv".into()],
        }
    }
}

impl SegmentationStrategy for DelimitedRecordStrategy {
    fn supports(
        &self,
        _local_cfg: &LocalEntityConfig,
        filestore: &dyn VirtualFilestore,
        source_file: &str,
    ) -> bool {
        let Some(extension) = std::path::Path::new(source_file)
            .extension()
            .and_then(|ext| ext.to_str())
        else {
            return false;
        };
        self.extensions.iter().any(|ext| ext == extension)
            && filestore.is_file(source_file).unwrap_or(false)
    }

    fn preserves_record_boundaries(&self) -> bool {
        true
    }

    fn new_segmenter(
        &self,
        filestore: Arc<dyn VirtualFilestore>,
        source_file: &str,
        max_segment_len: usize,
    ) -> Result<Box<dyn Segmenter>, SegmenterError> {
        Ok(Box::new(DelimitedRecordSegmenter {
            inner: FixedSizeSegmenter::new(filestore, source_file, max_segment_len)?,
            delimiter: self.delimiter,
            in_record: false,
        }))
    }
}

struct DelimitedRecordSegmenter {
    inner: FixedSizeSegmenter,
    delimiter: u8,
    in_record: bool,
}

impl Segmenter for DelimitedRecordSegmenter {
    fn next_segment(&mut self) -> Result<Option<FileSegment>, SegmenterError> {
        let Some(mut segment) = self.inner.next_segment()? else {
            return Ok(None);
        };
        // Cut behind the last delimiter so that records stay whole where possible.
        if let Some(last) = segment.data.iter().rposition(|b| *b == self.delimiter) {
            let cut = last + 1;
            if cut < segment.data.len() {
                self.inner.offset -= (segment.data.len() - cut) as u64;
                segment.data.truncate(cut);
            }
        }
        let starts_record = !self.in_record;
        let ends_record = segment.data.last() == Some(&self.delimiter)
            || segment.offset + segment.data.len() as u64 >= self.inner.file_size;
        self.in_record = !ends_record;
        let record_continuation_state = match (starts_record, ends_record) {
            (true, true) => RecordContinuationState::StartAndEnd,
            (true, false) => RecordContinuationState::StartWithoutEnd,
            (false, true) => RecordContinuationState::EndWithoutStart,
            (false, false) => RecordContinuationState::NoStartNoEnd,
        };
        segment.segment_metadata = Some(SegmentMetadata {
            record_continuation_state,
            metadata: Vec::new(),
        });
        Ok(Some(segment))
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

/// Outcome of [SegmentationChain::select].
pub struct SegmenterSelection {
    pub segmenter: Box<dyn Segmenter>,
    /// Record boundary preservation was requested but no strategy can provide it.
    pub record_boundaries_unsupported: bool,
}

#[derive(Default)]
pub struct SegmentationChain {
    strategies: Vec<Box<dyn SegmentationStrategy>>,
}

impl SegmentationChain {
    pub fn new(strategies: Vec<Box<dyn SegmentationStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn push(&mut self, strategy: Box<dyn SegmentationStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn select(
        &self,
        local_cfg: &LocalEntityConfig,
        filestore: Arc<dyn VirtualFilestore>,
        source_file: &str,
        max_segment_len: usize,
        record_boundaries: bool,
    ) -> Result<SegmenterSelection, SegmenterError> {
        let matching = self.strategies.iter().find(|strategy| {
            strategy.supports(local_cfg, filestore.as_ref(), source_file)
                && (!record_boundaries || strategy.preserves_record_boundaries())
        });
        if let Some(strategy) = matching {
            return Ok(SegmenterSelection {
                segmenter: strategy.new_segmenter(filestore, source_file, max_segment_len)?,
                record_boundaries_unsupported: false,
            });
        }
        Ok(SegmenterSelection {
            segmenter: FixedSizeStrategy.new_segmenter(filestore, source_file, max_segment_len)?,
            record_boundaries_unsupported: record_boundaries,
        })
    }
}
