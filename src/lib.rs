// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

pub mod api;
pub mod attribute;
pub mod cancel;
pub mod device;
pub mod errors;
pub mod file;
pub mod file_info;
pub mod fixup;
pub mod index;
pub mod journal;
pub mod mft;
pub mod parser;
pub mod path;
pub mod stream;
pub mod test_utils;
pub mod volume;
