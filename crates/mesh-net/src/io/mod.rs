mod reader;
mod writer;

pub(crate) use reader::reader_loop;
pub(crate) use writer::writer_loop;
