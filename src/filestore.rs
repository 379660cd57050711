//! Virtual filestore abstraction and filestore directives.
//!
//! All file system access of the engine goes through [VirtualFilestore]. Filestore failures never
//! raise protocol faults on their own. They are folded into file status reporting and the
//! [FilestoreResponse]s of the [FilestoreRequest]s which were attached to a transaction.
use std::{
    fs::{self, File, OpenOptions},
    io::{BufReader, Read, Seek, SeekFrom, Write},
    path::Path,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use spacepackets::cfdp::ChecksumType;

use crate::checksum::RunningChecksum;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FilestoreError {
    #[error("file does not exist")]
    FileDoesNotExist,
    #[error("file already exists")]
    FileAlreadyExists,
    #[error("directory does not exist")]
    DirDoesNotExist,
    #[error("permission error")]
    Permission,
    #[error("is not a file")]
    IsNotFile,
    #[error("is not a directory")]
    IsNotDirectory,
    #[error("read buffer too small: {found} < {expected}")]
    BufferTooSmall { found: usize, expected: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum type not implemented: {0:?}")]
    ChecksumTypeNotImplemented(ChecksumType),
    #[error("utf8 error")]
    Utf8Error,
    #[error("other error")]
    Other,
}

/// Abstraction of the file system used by a CFDP entity.
///
/// The open-for-read and open-for-write operations of the standard are expressed as offset based
/// [Self::read_data], [Self::write_data] and [Self::append_bytes] calls so that implementations
/// can be shared between transaction workers.
pub trait VirtualFilestore: Send + Sync {
    fn create_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    fn rename_file(&self, old_path: &str, new_path: &str) -> Result<(), FilestoreError>;

    /// Truncating a file means deleting all its data so the resulting file is empty.
    fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    fn append_bytes(&self, file_path: &str, data: &[u8]) -> Result<(), FilestoreError>;

    /// Replaces the bytes at the given offset, growing the file if required.
    fn write_data(&self, file_path: &str, offset: u64, data: &[u8]) -> Result<(), FilestoreError>;

    /// Appends the content of `src_path` to `dest_path`.
    fn append_file(&self, dest_path: &str, src_path: &str) -> Result<(), FilestoreError>;

    /// Replaces the content of `dest_path` with the content of `src_path`.
    fn replace_file(&self, dest_path: &str, src_path: &str) -> Result<(), FilestoreError>;

    fn create_dir(&self, dir_path: &str) -> Result<(), FilestoreError>;

    fn remove_dir(&self, dir_path: &str, all: bool) -> Result<(), FilestoreError>;

    fn list_dir(&self, dir_path: &str) -> Result<Vec<String>, FilestoreError>;

    fn read_data(
        &self,
        file_path: &str,
        offset: u64,
        read_len: u64,
        buf: &mut [u8],
    ) -> Result<(), FilestoreError>;

    fn is_file(&self, path: &str) -> Result<bool, FilestoreError>;

    fn is_dir(&self, path: &str) -> Result<bool, FilestoreError> {
        Ok(!self.is_file(path)?)
    }

    fn exists(&self, path: &str) -> Result<bool, FilestoreError>;

    /// Extract the file name part of a full path.
    ///
    /// This method should behave similarly to the [std::path::Path::file_name] method.
    fn file_name<'a>(&self, full_path: &'a str) -> Result<Option<&'a str>, FilestoreError>;

    fn file_size(&self, path: &str) -> Result<u64, FilestoreError>;

    /// Unbounded files have no known size when a transfer starts, for example named pipes.
    fn is_unbounded_file(&self, _path: &str) -> Result<bool, FilestoreError> {
        Ok(false)
    }

    /// This special function is the CFDP specific abstraction to calculate the checksum of a file.
    /// This allows to keep OS specific details like reading the whole file in the most efficient
    /// manner inside the file system abstraction.
    ///
    /// The passed verification buffer argument will be used by the specific implementation as
    /// a buffer to read the file into. It is recommended to use common buffer sizes like
    /// 4096 or 8192 bytes.
    fn calculate_checksum(
        &self,
        file_path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<u32, FilestoreError>;

    fn checksum_verify(
        &self,
        expected_checksum: u32,
        file_path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<bool, FilestoreError> {
        Ok(
            self.calculate_checksum(file_path, checksum_type, size_to_verify, verification_buf)?
                == expected_checksum,
        )
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct NativeFilestore {}

impl NativeFilestore {
    fn check_is_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        if !self.exists(file_path)? {
            return Err(FilestoreError::FileDoesNotExist);
        }
        if !self.is_file(file_path)? {
            return Err(FilestoreError::IsNotFile);
        }
        Ok(())
    }

    fn check_is_dir(&self, dir_path: &str) -> Result<(), FilestoreError> {
        if !self.exists(dir_path)? {
            return Err(FilestoreError::DirDoesNotExist);
        }
        if !self.is_dir(dir_path)? {
            return Err(FilestoreError::IsNotDirectory);
        }
        Ok(())
    }
}

impl VirtualFilestore for NativeFilestore {
    fn create_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        if self.exists(file_path)? {
            return Err(FilestoreError::FileAlreadyExists);
        }
        File::create(file_path)?;
        Ok(())
    }

    fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        self.check_is_file(file_path)?;
        fs::remove_file(file_path)?;
        Ok(())
    }

    fn rename_file(&self, old_path: &str, new_path: &str) -> Result<(), FilestoreError> {
        self.check_is_file(old_path)?;
        if self.exists(new_path)? {
            return Err(FilestoreError::FileAlreadyExists);
        }
        if fs::rename(old_path, new_path).is_err() {
            // Renaming fails across mount points, fall back to copying.
            fs::copy(old_path, new_path)?;
            fs::remove_file(old_path)?;
        }
        Ok(())
    }

    fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        self.check_is_file(file_path)?;
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(file_path)?;
        Ok(())
    }

    fn append_bytes(&self, file_path: &str, data: &[u8]) -> Result<(), FilestoreError> {
        self.check_is_file(file_path)?;
        let mut file = OpenOptions::new().append(true).open(file_path)?;
        file.write_all(data)?;
        Ok(())
    }

    fn write_data(&self, file_path: &str, offset: u64, data: &[u8]) -> Result<(), FilestoreError> {
        self.check_is_file(file_path)?;
        let mut file = OpenOptions::new().write(true).open(file_path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn append_file(&self, dest_path: &str, src_path: &str) -> Result<(), FilestoreError> {
        self.check_is_file(dest_path)?;
        self.check_is_file(src_path)?;
        let mut src = BufReader::new(File::open(src_path)?);
        let mut dest = OpenOptions::new().append(true).open(dest_path)?;
        std::io::copy(&mut src, &mut dest)?;
        Ok(())
    }

    fn replace_file(&self, dest_path: &str, src_path: &str) -> Result<(), FilestoreError> {
        self.check_is_file(dest_path)?;
        self.check_is_file(src_path)?;
        fs::copy(src_path, dest_path)?;
        Ok(())
    }

    fn create_dir(&self, dir_path: &str) -> Result<(), FilestoreError> {
        fs::create_dir(dir_path)?;
        Ok(())
    }

    fn remove_dir(&self, dir_path: &str, all: bool) -> Result<(), FilestoreError> {
        self.check_is_dir(dir_path)?;
        if !all {
            fs::remove_dir(dir_path)?;
            return Ok(());
        }
        fs::remove_dir_all(dir_path)?;
        Ok(())
    }

    fn list_dir(&self, dir_path: &str) -> Result<Vec<String>, FilestoreError> {
        self.check_is_dir(dir_path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir_path)? {
            let name = entry?.file_name();
            entries.push(
                name.into_string()
                    .map_err(|_| FilestoreError::Utf8Error)?,
            );
        }
        entries.sort();
        Ok(entries)
    }

    fn read_data(
        &self,
        file_path: &str,
        offset: u64,
        read_len: u64,
        buf: &mut [u8],
    ) -> Result<(), FilestoreError> {
        if buf.len() < read_len as usize {
            return Err(FilestoreError::BufferTooSmall {
                found: buf.len(),
                expected: read_len as usize,
            });
        }
        self.check_is_file(file_path)?;
        let mut file = File::open(file_path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[0..read_len as usize])?;
        Ok(())
    }

    fn is_file(&self, str_path: &str) -> Result<bool, FilestoreError> {
        let path = Path::new(str_path);
        if !path.exists() {
            return Err(FilestoreError::FileDoesNotExist);
        }
        Ok(path.is_file())
    }

    fn exists(&self, path: &str) -> Result<bool, FilestoreError> {
        Ok(Path::new(path).exists())
    }

    fn file_name<'a>(&self, full_path: &'a str) -> Result<Option<&'a str>, FilestoreError> {
        let path = Path::new(full_path);
        path.file_name()
            .map(|s| s.to_str())
            .ok_or(FilestoreError::Utf8Error)
    }

    fn file_size(&self, str_path: &str) -> Result<u64, FilestoreError> {
        self.check_is_file(str_path)?;
        Ok(Path::new(str_path).metadata()?.len())
    }

    fn calculate_checksum(
        &self,
        file_path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<u32, FilestoreError> {
        let mut checksum = RunningChecksum::new(checksum_type)
            .ok_or(FilestoreError::ChecksumTypeNotImplemented(checksum_type))?;
        if checksum_type == ChecksumType::NullChecksum {
            return Ok(0);
        }
        if verification_buf.is_empty() {
            return Err(FilestoreError::BufferTooSmall {
                found: 0,
                expected: 1,
            });
        }
        let mut buf_reader = BufReader::new(File::open(file_path)?);
        let mut offset = 0;
        while offset < size_to_verify {
            // Read the smaller of the remaining bytes or the buffer size
            let bytes_to_read =
                (size_to_verify - offset).min(verification_buf.len() as u64) as usize;
            let bytes_read = buf_reader.read(&mut verification_buf[0..bytes_to_read])?;
            if bytes_read == 0 {
                break;
            }
            checksum.update(offset, &verification_buf[0..bytes_read]);
            offset += bytes_read as u64;
        }
        Ok(checksum.value())
    }
}

/// Filestore request actions as specified in chapter 5.4.1 of the CFDP standard.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum FilestoreAction {
    CreateFile = 0b0000,
    DeleteFile = 0b0001,
    RenameFile = 0b0010,
    AppendFile = 0b0011,
    ReplaceFile = 0b0100,
    CreateDirectory = 0b0101,
    RemoveDirectory = 0b0110,
    /// Delete the file if it exists.
    DenyFile = 0b0111,
    /// Remove the directory if it exists.
    DenyDirectory = 0b1000,
}

impl FilestoreAction {
    pub fn has_second_name(&self) -> bool {
        matches!(
            self,
            FilestoreAction::RenameFile | FilestoreAction::AppendFile | FilestoreAction::ReplaceFile
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FilestoreRequest {
    pub action: FilestoreAction,
    pub first_name: String,
    pub second_name: Option<String>,
}

impl FilestoreRequest {
    pub fn new(action: FilestoreAction, first_name: impl Into<String>) -> Self {
        Self {
            action,
            first_name: first_name.into(),
            second_name: None,
        }
    }

    pub fn new_with_second_name(
        action: FilestoreAction,
        first_name: impl Into<String>,
        second_name: impl Into<String>,
    ) -> Self {
        Self {
            action,
            first_name: first_name.into(),
            second_name: Some(second_name.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FilestoreStatus {
    Successful,
    Failed(String),
    NotPerformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FilestoreResponse {
    pub action: FilestoreAction,
    pub status: FilestoreStatus,
}

impl FilestoreResponse {
    pub fn is_successful(&self) -> bool {
        self.status == FilestoreStatus::Successful
    }
}

fn execute_filestore_request(
    filestore: &dyn VirtualFilestore,
    request: &FilestoreRequest,
) -> Result<(), FilestoreError> {
    let first = request.first_name.as_str();
    let second = || {
        request
            .second_name
            .as_deref()
            .ok_or(FilestoreError::Other)
    };
    match request.action {
        FilestoreAction::CreateFile => filestore.create_file(first),
        FilestoreAction::DeleteFile => filestore.remove_file(first),
        FilestoreAction::RenameFile => filestore.rename_file(first, second()?),
        FilestoreAction::AppendFile => filestore.append_file(first, second()?),
        FilestoreAction::ReplaceFile => filestore.replace_file(first, second()?),
        FilestoreAction::CreateDirectory => filestore.create_dir(first),
        FilestoreAction::RemoveDirectory => filestore.remove_dir(first, false),
        FilestoreAction::DenyFile => {
            if filestore.exists(first)? {
                filestore.remove_file(first)?;
            }
            Ok(())
        }
        FilestoreAction::DenyDirectory => {
            if filestore.exists(first)? {
                filestore.remove_dir(first, false)?;
            }
            Ok(())
        }
    }
}

/// Executes the requests in order. The first failure halts the sequence and every subsequent
/// request is reported as [FilestoreStatus::NotPerformed].
pub fn execute_filestore_requests(
    filestore: &dyn VirtualFilestore,
    requests: &[FilestoreRequest],
) -> Vec<FilestoreResponse> {
    let mut failed = false;
    requests
        .iter()
        .map(|request| {
            let status = if failed {
                FilestoreStatus::NotPerformed
            } else {
                match execute_filestore_request(filestore, request) {
                    Ok(()) => FilestoreStatus::Successful,
                    Err(e) => {
                        log::warn!("filestore request {:?} failed: {}", request, e);
                        failed = true;
                        FilestoreStatus::Failed(e.to_string())
                    }
                }
            };
            FilestoreResponse {
                action: request.action,
                status,
            }
        })
        .collect()
}
