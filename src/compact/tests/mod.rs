mod helpers;

mod tests_postlist;
