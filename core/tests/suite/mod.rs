mod dedup;
mod failure;
mod lifecycle;
