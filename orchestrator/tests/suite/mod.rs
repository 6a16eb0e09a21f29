mod multi_run;
mod spawner;
