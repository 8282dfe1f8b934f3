pub mod claim;
pub mod dispatcher;
pub mod feed;
pub mod frames;
pub mod inference;
pub mod intake;
pub mod pipeline;
pub mod poller;
pub mod staging;
pub mod storage;
