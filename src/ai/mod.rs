pub mod brain;
