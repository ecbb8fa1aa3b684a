//! Append-only data files, their collections and the file compactor.

mod collection;
mod compactor;
mod data_file;

pub use collection::DataFileCollection;
pub use compactor::{CompactionLimits, FileCompactor};
pub use data_file::{
    data_location, file_name, location_file, location_offset, DataFileReader, DataFileWriter,
};
