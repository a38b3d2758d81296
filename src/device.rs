// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::io::{self, Read, Seek, SeekFrom};

/// Raw access to the bytes of a volume.
///
/// `read_bytes` may return fewer bytes than requested when the read crosses
/// the end of the device; callers decide whether a short read is an error.
pub trait BlockDevice {
    fn read_bytes(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>>;

    fn device_control(
        &mut self,
        _code: u32,
        _input: &[u8],
        _output_size: usize,
    ) -> io::Result<Vec<u8>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "device control is not supported by this device",
        ))
    }

    fn volume_letter(&self) -> Option<char> {
        None
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn read_bytes(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        (**self).read_bytes(offset, length)
    }

    fn device_control(
        &mut self,
        code: u32,
        input: &[u8],
        output_size: usize,
    ) -> io::Result<Vec<u8>> {
        (**self).device_control(code, input, output_size)
    }

    fn volume_letter(&self) -> Option<char> {
        (**self).volume_letter()
    }
}

/// Turns arbitrary reads into reads of whole `alignment` sized blocks, which
/// is what raw volume handles require.
pub struct AlignedReader<R>
where
    R: Read + Seek,
{
    inner: R,
    alignment: u64,
    position: u64,

    buffer_pos: u64,
    buffer: Vec<u8>,
}

impl<R> AlignedReader<R>
where
    R: Read + Seek,
{
    pub fn new(inner: R, alignment: u64) -> io::Result<Self> {
        if !alignment.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        Ok(Self {
            inner,
            alignment,
            position: 0,
            buffer_pos: 0,
            buffer: Vec::with_capacity(alignment as usize),
        })
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    fn round_down(&self, n: u64) -> u64 {
        n / self.alignment * self.alignment
    }

    fn round_up(&self, n: u64) -> u64 {
        if n.is_multiple_of(self.alignment) {
            n
        } else {
            self.round_down(n) + self.alignment
        }
    }

    // Fills the internal buffer with the aligned window, stopping early at
    // the end of the device.
    fn fill(&mut self, aligned_position: u64, size: usize) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(aligned_position))?;
        self.buffer.resize(size, 0u8);

        let mut filled = 0usize;
        while filled < size {
            match self.inner.read(&mut self.buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.buffer.truncate(filled);
        self.buffer_pos = aligned_position;
        Ok(())
    }
}

impl<R> Read for AlignedReader<R>
where
    R: Read + Seek,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let aligned_position = self.round_down(self.position);

        let start = (self.position - aligned_position) as usize;
        let end = start + buf.len();
        let size = self.round_up(end as u64) as usize;

        let cached_end = self.buffer_pos + self.buffer.len() as u64;
        if aligned_position != self.buffer_pos || self.position + buf.len() as u64 > cached_end {
            self.fill(aligned_position, size)?;
        }

        if start >= self.buffer.len() {
            return Ok(0);
        }

        let available = usize::min(end, self.buffer.len()) - start;
        buf[..available].copy_from_slice(&self.buffer[start..start + available]);

        self.position += available as u64;
        Ok(available)
    }
}

impl<R> Seek for AlignedReader<R>
where
    R: Read + Seek,
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let raw_position = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "seeking from the end of a volume",
                ));
            }
            SeekFrom::Current(n) => {
                if n >= 0 {
                    self.position.checked_add(n as u64)
                } else {
                    self.position.checked_sub(n.wrapping_neg() as u64)
                }
            }
        };

        match raw_position {
            Some(n) => {
                self.position = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid position",
            )),
        }
    }
}

/// A volume image behind any `Read + Seek` source.
pub struct FileDevice<R>
where
    R: Read + Seek,
{
    reader: AlignedReader<R>,
    letter: Option<char>,
}

impl<R> FileDevice<R>
where
    R: Read + Seek,
{
    pub fn new(inner: R) -> io::Result<Self> {
        Self::aligned(inner, 512, None)
    }

    pub fn with_letter(inner: R, letter: char) -> io::Result<Self> {
        Self::aligned(inner, 512, Some(letter))
    }

    fn aligned(inner: R, alignment: u64, letter: Option<char>) -> io::Result<Self> {
        Ok(FileDevice {
            reader: AlignedReader::new(inner, alignment)?,
            letter: letter.map(|l| l.to_ascii_uppercase()),
        })
    }

    pub fn get_ref(&self) -> &R {
        self.reader.get_ref()
    }
}

impl<R> BlockDevice for FileDevice<R>
where
    R: Read + Seek,
{
    fn read_bytes(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
        self.reader.seek(SeekFrom::Start(offset))?;

        let mut data = vec![0u8; length];
        let mut filled = 0usize;
        while filled < length {
            match self.reader.read(&mut data[filled..])? {
                0 => break,
                n => filled += n,
            }
        }

        data.truncate(filled);
        Ok(data)
    }

    fn volume_letter(&self) -> Option<char> {
        self.letter
    }
}

#[cfg(windows)]
pub use self::windows_volume::{is_elevated, open_volume, VolumeDevice};

#[cfg(windows)]
mod windows_volume {
    use std::fs::File;
    use std::io;
    use std::os::windows::io::AsRawHandle;

    use windows::Win32::{
        Foundation::{
            CloseHandle, ERROR_ACCESS_DENIED, ERROR_INVALID_FUNCTION, ERROR_NOT_SUPPORTED, HANDLE,
        },
        Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY},
        System::{
            Ioctl,
            Threading::{GetCurrentProcess, OpenProcessToken},
            IO::DeviceIoControl,
        },
    };

    use tracing::info;

    use super::{BlockDevice, FileDevice};
    use crate::api::{FSCTL_QUERY_USN_JOURNAL, FSCTL_READ_USN_JOURNAL};
    use crate::errors::{NtfsError, NtfsResult};

    // The journal reader is platform neutral and carries its own control codes.
    const _: () = assert!(FSCTL_QUERY_USN_JOURNAL == Ioctl::FSCTL_QUERY_USN_JOURNAL);
    const _: () = assert!(FSCTL_READ_USN_JOURNAL == Ioctl::FSCTL_READ_USN_JOURNAL);

    /// `\\.\X:` opened for raw reads.
    pub struct VolumeDevice {
        inner: FileDevice<File>,
    }

    pub fn open_volume(letter: char) -> NtfsResult<VolumeDevice> {
        if !is_elevated().unwrap_or(false) {
            return Err(NtfsError::ElevationError);
        }

        let letter = letter.to_ascii_uppercase();
        let file = File::open(format!("\\\\.\\{}:", letter))?;
        let inner = FileDevice::aligned(file, 4096, Some(letter))?;
        info!("Opened volume {}:", letter);

        Ok(VolumeDevice { inner })
    }

    impl BlockDevice for VolumeDevice {
        fn read_bytes(&mut self, offset: u64, length: usize) -> io::Result<Vec<u8>> {
            self.inner.read_bytes(offset, length)
        }

        fn device_control(
            &mut self,
            code: u32,
            input: &[u8],
            output_size: usize,
        ) -> io::Result<Vec<u8>> {
            let handle = HANDLE(self.inner.get_ref().as_raw_handle());
            let mut output = vec![0u8; output_size];
            let mut returned = 0u32;

            unsafe {
                DeviceIoControl(
                    handle,
                    code,
                    Some(input.as_ptr() as *const _),
                    input.len() as u32,
                    Some(output.as_mut_ptr() as *mut _),
                    output_size as u32,
                    Some(&mut returned as *mut u32),
                    None,
                )
                .map_err(|err| device_io_error(err, code))?;
            }

            output.truncate(returned as usize);
            Ok(output)
        }

        fn volume_letter(&self) -> Option<char> {
            self.inner.volume_letter()
        }
    }

    pub fn is_elevated() -> windows::core::Result<bool> {
        unsafe {
            let mut handle: HANDLE = HANDLE::default();
            OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut handle)?;

            let mut elevation = TOKEN_ELEVATION::default();
            let mut returned_length = 0;

            let result = GetTokenInformation(
                handle,
                TokenElevation,
                Some(&mut elevation as *mut _ as *mut _),
                std::mem::size_of::<TOKEN_ELEVATION>() as u32,
                &mut returned_length,
            );
            let _ = CloseHandle(handle);
            result?;

            Ok(elevation.TokenIsElevated != 0)
        }
    }

    fn device_io_error(err: windows::core::Error, code: u32) -> io::Error {
        let hresult = err.code();
        let kind = if hresult == ERROR_ACCESS_DENIED.to_hresult() {
            io::ErrorKind::PermissionDenied
        } else if hresult == ERROR_INVALID_FUNCTION.to_hresult()
            || hresult == ERROR_NOT_SUPPORTED.to_hresult()
        {
            io::ErrorKind::Unsupported
        } else {
            io::ErrorKind::Other
        };

        io::Error::new(kind, format!("control code {code:#010x} failed: {err}"))
    }
}
