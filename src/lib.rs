#![forbid(unsafe_code)]

//! Shared library behind the `backend` and `grab` binaries.
//!
//! Resolves video links with yt-dlp, flags likely duplicate songs before
//! anything is downloaded, downloads a selection in parallel and packages the
//! result. The duplicate detector (`detector`, `normalize`, `similarity`) has
//! no I/O and can be used on its own.

pub mod config;
pub mod detector;
pub mod logging;
pub mod media;
pub mod normalize;
pub mod packaging;
pub mod session;
pub mod similarity;
pub mod ytdlp;
