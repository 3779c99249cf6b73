mod config;
mod convert;
mod export;
mod fat;
mod parse;
mod validate;
