// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::io::{self, Write};

/// Destination of dump output. Each call receives a self-contained chunk:
/// whole serialized records or whole file blocks, never a split one.
pub trait OutStream {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()>;
}

impl<W: Write> OutStream for W {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.write_all(chunk)?;
        self.flush()
    }
}
