mod tests_compaction;
mod tests_shrink;
